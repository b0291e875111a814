use std::{env, fmt::Display};

use crate::config::{AppConfig, SourceKind};
use crate::session::log_file_path;
use crate::transport::{self, ByteSource, UdpSource};

pub struct DoctorReport {
    lines: Vec<String>,
}

impl DoctorReport {
    pub fn new(title: &str) -> Self {
        Self {
            lines: vec![title.to_string()],
        }
    }

    pub fn section(&mut self, title: &str) {
        self.lines.push(String::new());
        self.lines.push(format!("{title}:"));
    }

    pub fn push_kv(&mut self, key: &str, value: impl Display) {
        self.lines.push(format!("  {key}: {value}"));
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

pub fn doctor_report(config: &AppConfig) -> DoctorReport {
    let mut report = DoctorReport::new("Wavetap Doctor");
    report.push_kv("version", env!("CARGO_PKG_VERSION"));
    report.push_kv("os", format!("{}/{}", env::consts::OS, env::consts::ARCH));

    let mut validated = config.clone();
    let validation_result = validated.validate();

    report.section("Config");
    match validation_result {
        Ok(()) => report.push_kv("validation", "ok"),
        Err(err) => report.push_kv("validation", format!("error: {err}")),
    }
    report.push_kv("source", config.source);
    report.push_kv(
        "format",
        format!(
            "{} Hz, {} channel(s), {} byte(s)/sample",
            config.sample_rate, config.channels, config.sample_width
        ),
    );
    report.push_kv("dc_offset", config.dc_offset);
    report.push_kv("gate", config.gate);
    report.push_kv("seconds", config.seconds);
    report.push_kv("output", config.output.display());
    report.push_kv("log_file", log_file_path().display());

    report.section("Transport");
    match config.source {
        SourceKind::Udp => {
            report.push_kv(
                "listen",
                format!("{}:{}", config.listen_ip, config.listen_port),
            );
            // Bind-and-drop probe; the real listener opens later.
            match UdpSource::bind(config.listen_ip, config.listen_port) {
                Ok(source) => report.push_kv("udp_bind", format!("ok ({})", source.describe())),
                Err(err) => report.push_kv("udp_bind", format!("error: {err:#}")),
            }
        }
        SourceKind::Serial => {
            report.push_kv(
                "serial_port",
                config.serial_port.as_deref().unwrap_or("unset"),
            );
            report.push_kv("baud", config.baud);
        }
    }
    match transport::list_ports() {
        Ok(ports) => {
            report.push_kv("serial_port_count", ports.len());
            if ports.is_empty() {
                report.push_kv("serial_ports", "none");
            } else {
                report.push_line("  serial_ports:");
                for name in ports {
                    report.push_line(format!("    - {name}"));
                }
            }
        }
        Err(err) => report.push_kv("serial_ports", format!("error: {err}")),
    }

    report
}
