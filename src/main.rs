use anyhow::Result;
use clap::Parser;
use std::env;
use wavetap::{
    config::AppConfig, doctor::doctor_report, init_debug_log_file, log_debug, log_file_path,
    meter, run_session, transport,
};

#[cfg(not(test))]
fn main() -> Result<()> {
    run_with_args(env::args_os())
}

#[cfg_attr(test, allow(dead_code))]
fn run_with_args<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let mut config = AppConfig::parse_from(args);
    if config.doctor {
        let report = doctor_report(&config);
        println!("{}", report.render());
        return Ok(());
    }

    if config.list_ports {
        let output = list_ports_output()?;
        print!("{output}");
        return Ok(());
    }

    config.validate()?;

    if config.meter {
        return meter::run_meter(&config);
    }

    init_debug_log_file();
    log_debug("=== wavetap capture starting ===");
    log_debug(&format!("Log file: {:?}", log_file_path()));

    let summary = run_session(&config)?;
    if config.emit_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary.render());
    }
    if let Some(warning) = summary.shortfall_warning() {
        eprintln!("Warning: {warning}");
    }

    log_debug("=== wavetap capture finished ===");
    Ok(())
}

fn list_ports_output() -> Result<String> {
    let ports = transport::list_ports()?;
    let mut output = String::new();
    if ports.is_empty() {
        output.push_str("No serial ports detected.\n");
    } else {
        output.push_str("Detected serial ports:\n");
        for name in ports {
            output.push_str(&format!("  - {name}\n"));
        }
    }
    Ok(output)
}
