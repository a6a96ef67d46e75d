use device_trust::{Config, init_tracing, reconcile};

fn print_usage(bin_name: &str) {
    eprintln!("Usage: {bin_name} reconcile");
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let mut args = std::env::args();
    let bin_name = args.next().unwrap_or_else(|| "maint".to_string());
    let command = args.next();

    if command.as_deref() != Some("reconcile") || args.next().is_some() {
        print_usage(&bin_name);
        std::process::exit(2);
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.logging.level, config.logging.json_format);

    if let Err(err) = config.validate() {
        eprintln!("{err}");
        std::process::exit(1);
    }

    match reconcile(&config).await {
        Ok(result) => {
            println!(
                "Device quota reconciliation completed: quota={}, sessions_evicted={}",
                result.quota, result.sessions_evicted
            );
        }
        Err(err) => {
            eprintln!("Reconciliation failed: {err:?}");
            std::process::exit(1);
        }
    }
}
