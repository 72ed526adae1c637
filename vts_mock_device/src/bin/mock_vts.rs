use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use vts_mock_device::{DeviceState, MockDevice};

const DEFAULT_ADDR: &str = "127.0.0.1:8001";

fn parse_arg_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let addr = parse_arg_value(&args, "--addr")
        .or_else(|| std::env::var("VTS_MOCK_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let addr_file = parse_arg_value(&args, "--addr-file").map(PathBuf::from);
    let run_for_ms = parse_arg_value(&args, "--run-for-ms")
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis);
    let deny_tokens = args.iter().any(|a| a == "--deny-tokens");

    let mut state = DeviceState::demo();
    state.deny_token_requests = deny_tokens;

    let device = match MockDevice::spawn_with_addr(&addr, state) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if let Some(path) = &addr_file {
        let _ = fs::write(path, device.listen_addr().to_string());
    }

    println!("mock_vts listening on ws://{}", device.listen_addr());

    let control = device.control();
    let start = Instant::now();
    let mut announced = 0;
    loop {
        thread::sleep(Duration::from_millis(100));

        let issued = control.issued_tokens();
        for token in issued.iter().skip(announced) {
            println!("issued token {}…", &token[..8.min(token.len())]);
        }
        announced = issued.len();

        if let Some(max) = run_for_ms {
            if start.elapsed() >= max {
                break;
            }
        }
    }

    device.shutdown();
}
