mod calibration;
mod kernel;

use std::cell::RefCell;
use std::env;
use std::fs;
use std::process;
use std::rc::Rc;

use calibration::{GyroCal, GyroCalParams};
use kernel::image::{AppHeader, SharedAreaBuilder, MARKER_INTERNAL, MARKER_VALID};
use kernel::{
    AppHost, AppId, AppIdSelector, AppInstance, EventData, Kernel, LoadError, SensorApp, Tid,
    EVT_APP_START, EVT_NO_FIRST_USER_EVENT,
};

/// Demo broadcast event.
const EVT_DEMO_PING: u32 = EVT_NO_FIRST_USER_EVENT + 0x10;

const VENDOR_DEMO: u64 = 0x446D6F;

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "kernel" => {
                run_kernel_demo();
                return;
            }
            "cal" => {
                run_cal_demo(args.get(2).map(String::as_str));
                return;
            }
            _ => {
                print_usage();
                return;
            }
        }
    }

    // Default: run both phases.
    run_kernel_demo();
    run_cal_demo(None);
}

fn print_usage() {
    eprintln!("Usage: sensorhub [command]");
    eprintln!("Commands:");
    eprintln!("  kernel        - Boot the kernel over a demo flash region");
    eprintln!("  cal [config]  - Run the gyro-bias calibration simulation");
    eprintln!("  (none)        - Both phases");
}

// =============================================================================
// KERNEL DEMO
// =============================================================================

/// Minimal app used by the demo: counts the events it sees.
struct DemoApp {
    label: &'static str,
    received: Rc<RefCell<Vec<u32>>>,
}

impl SensorApp for DemoApp {
    fn init(&mut self, kernel: &mut Kernel, tid: Tid) -> bool {
        kernel.subscribe(tid, EVT_APP_START);
        kernel.subscribe(tid, EVT_DEMO_PING);
        true
    }

    fn handle(&mut self, _kernel: &mut Kernel, evt_type: u32, _data: &EventData) {
        self.received.borrow_mut().push(evt_type);
    }

    fn end(&mut self, _kernel: &mut Kernel) {
        println!("  app '{}' stopped", self.label);
    }
}

struct DemoHost {
    received: Rc<RefCell<Vec<u32>>>,
}

impl DemoHost {
    fn label_for(app_id: AppId) -> &'static str {
        match app_id.seq_id() {
            1 => "led",
            2 => "tilt",
            _ => "monitor",
        }
    }
}

impl AppHost for DemoHost {
    fn load(&mut self, header: &AppHeader, _payload: &[u8]) -> Result<AppInstance, LoadError> {
        Ok(Rc::new(RefCell::new(DemoApp {
            label: DemoHost::label_for(header.app_id),
            received: self.received.clone(),
        })))
    }

    fn load_internal(&mut self, header: &AppHeader) -> Result<AppInstance, LoadError> {
        self.load(header, &[])
    }

    fn unload(&mut self, _header: &AppHeader, _instance: &AppInstance) {}
}

fn run_kernel_demo() {
    println!("=== Kernel demo ===");

    let led = AppId::from_parts(VENDOR_DEMO, 1);
    let tilt = AppId::from_parts(VENDOR_DEMO, 2);
    let monitor = AppId::from_parts(VENDOR_DEMO, 3);

    // A region holding an outdated LED image, its replacement, and a tilt
    // app. The newer LED copy must win and the older one must be erased.
    let shared = SharedAreaBuilder::new()
        .app(&AppHeader::new(led, 1, MARKER_VALID), &[])
        .app(&AppHeader::new(led, 2, MARKER_VALID), &[])
        .app(&AppHeader::new(tilt, 1, MARKER_VALID), &[])
        .build(4096);

    let received = Rc::new(RefCell::new(Vec::new()));
    let host = DemoHost { received: received.clone() };
    let mut kernel = Kernel::new(shared, Box::new(host));

    let status = kernel.boot(&[AppHeader::new(monitor, 1, MARKER_INTERNAL)]);
    println!("boot status: {}", status);
    kernel.run_until_idle();

    println!("running apps:");
    let mut index = 0;
    while let Some(info) = kernel.app_info_by_index(index) {
        println!(
            "  [{}] {} v{} ({} bytes)",
            info.index,
            DemoHost::label_for(info.app_id),
            info.app_version,
            info.app_size
        );
        index += 1;
    }

    kernel.enqueue(EVT_DEMO_PING, EventData::None, None);
    kernel.run_until_idle();
    println!("events delivered: {}", received.borrow().len());

    let status = kernel.erase_apps(AppIdSelector::exact(led));
    println!("erase led: {}", status);
    println!("tasks remaining: {}", kernel.task_count());
    println!();
}

// =============================================================================
// CALIBRATION DEMO
// =============================================================================

/// Small deterministic noise source so the demo needs no RNG.
struct Wobble {
    state: u64,
}

impl Wobble {
    fn new(seed: u64) -> Self {
        Wobble { state: seed }
    }

    /// Uniform-ish value in [-scale, scale].
    fn next(&mut self, scale: f32) -> f32 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let unit = (self.state >> 40) as f32 / ((1u64 << 24) as f32);
        (unit * 2.0 - 1.0) * scale
    }
}

fn run_cal_demo(config_path: Option<&str>) {
    println!("=== Calibration demo ===");

    let params = match config_path {
        Some(path) => {
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) => {
                    eprintln!("FATAL: cannot read {}: {}", path, err);
                    process::exit(1);
                }
            };
            match serde_json::from_str::<GyroCalParams>(&text) {
                Ok(params) => params,
                Err(err) => {
                    eprintln!("FATAL: bad calibration config {}: {}", path, err);
                    process::exit(1);
                }
            }
        }
        None => GyroCalParams {
            window_time_duration_nanos: 500_000_000,
            min_still_duration_nanos: 2_000_000_000,
            max_still_duration_nanos: 10_000_000_000,
            ..GyroCalParams::default()
        },
    };

    let mut cal = GyroCal::new(&params);
    let mut wobble = Wobble::new(0x5EED);

    // Eleven seconds of a perfectly still device at 100 Hz with a small
    // constant gyro offset. The max-duration path should emit once.
    let true_bias = [0.004f32, -0.002, 0.001];
    let mut emissions = 0u32;
    let mut t: u64 = 10_000_000;
    while t <= 11_000_000_000 {
        let gyro = [
            true_bias[0] + wobble.next(1.0e-5),
            true_bias[1] + wobble.next(1.0e-5),
            true_bias[2] + wobble.next(1.0e-5),
        ];
        cal.update_gyro(t, gyro, 25.0);
        cal.update_accel(
            t,
            [wobble.next(1.0e-3), wobble.next(1.0e-3), 9.81 + wobble.next(1.0e-3)],
        );
        if cal.new_bias_available() {
            emissions += 1;
            let (bias, temperature) = cal.get_bias();
            println!(
                "emission #{}: bias [rad/s] = ({:.6}, {:.6}, {:.6}) @ {:.1} C, t = {} ns",
                emissions,
                bias[0],
                bias[1],
                bias[2],
                temperature,
                cal.calibration_time_nanos()
            );
        }
        cal.debug_print(t);
        t += 10_000_000;
    }

    if emissions == 0 {
        println!("no calibration emitted (check the configured gates)");
    } else {
        let corrected = cal.remove_bias(true_bias);
        println!(
            "residual after removal: ({:.6}, {:.6}, {:.6})",
            corrected[0], corrected[1], corrected[2]
        );
    }
}
