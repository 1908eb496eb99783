fn main() {
    // Load .env file for station configuration
    load_env_config();

    // Only the firmware image needs the esp linker scripts; host builds run the test suite.
    if std::env::var_os("CARGO_FEATURE_ESP32C3").is_some() {
        linker_be_nice();
        // make sure linkall.x is the last linker script (otherwise might cause problems with flip-link)
        println!("cargo:rustc-link-arg=-Tlinkall.x");
    }
}

/// Compile-time defaults for the configuration keys, with their fallbacks.
const ENV_DEFAULTS: &[(&str, &str)] = &[
    ("WIFI_SSID", ""),
    ("WIFI_PASSWORD", ""),
    ("WLAB_MQTT_BROKER", "localhost"),
    ("WLAB_MQTT_PORT", "1883"),
    ("WLAB_NAME", "Station Name"),
    ("WLAB_TIMEZONE", "Europe/Warsaw"),
    ("WLAB_LATITUDE", "40"),
    ("WLAB_LONGITUDE", "30"),
];

/// Load environment configuration from .env file
/// Environment variables take priority over .env file values
fn load_env_config() {
    use std::env;
    use std::path::Path;

    // Tell cargo to rerun this build script if .env file changes
    println!("cargo:rerun-if-changed=.env");

    // Try to load .env file if it exists
    if Path::new(".env").exists() {
        match dotenvy::dotenv() {
            Ok(_) => println!("cargo:warning=Loaded .env file"),
            Err(e) => println!("cargo:warning=Failed to load .env file: {}", e),
        }
    }

    for (key, fallback) in ENV_DEFAULTS {
        // Tell cargo to rerun if environment variables change
        println!("cargo:rerun-if-env-changed={}", key);

        // Empty values count as unset
        let value = env::var(key)
            .map(|v| v.trim().to_string())
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.to_string());

        println!("cargo:rustc-env={}={}", key, value);
    }

    let ssid = env::var("WIFI_SSID").unwrap_or_default();
    if ssid.trim().is_empty() {
        println!("cargo:warning=WIFI_SSID is empty - WiFi will not be configured");
    }
}

fn linker_be_nice() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        let kind = &args[1];
        let what = &args[2];

        match kind.as_str() {
            "undefined-symbol" => match what.as_str() {
                "_stack_start" => {
                    eprintln!();
                    eprintln!("💡 Is the linker script `linkall.x` missing?");
                    eprintln!();
                }
                "esp_wifi_preempt_enable"
                | "esp_wifi_preempt_yield_task"
                | "esp_wifi_preempt_task_create" => {
                    eprintln!();
                    eprintln!("💡 `esp-wifi` has no scheduler enabled. Make sure you have the `builtin-scheduler` feature enabled, or that you provide an external scheduler.");
                    eprintln!();
                }
                _ => (),
            },
            // we don't have anything helpful for "missing-lib" yet
            _ => {
                std::process::exit(1);
            }
        }

        std::process::exit(0);
    }

    println!(
        "cargo:rustc-link-arg=--error-handling-script={}",
        std::env::current_exe().unwrap().display()
    );
}
