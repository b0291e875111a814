use std::io::{self, Write};

use anyhow::{anyhow, Result};

use crate::capture;
use crate::config::{AppConfig, MAX_METER_WINDOW_MS, MIN_METER_WINDOW_MS};
use crate::pcm::{peak_db, rms_db};
use crate::session;

const RECOMMENDED_FLOOR_DB: f32 = -80.0;
const RECOMMENDED_CEILING_DB: f32 = -10.0;

#[derive(Debug, Clone, Copy)]
struct MeterReading {
    rms_db: f32,
    peak_db: f32,
}

/// Sample the live transport for one window and reduce it to levels.
fn measure(config: &AppConfig, window_ms: u64) -> Result<MeterReading> {
    let decoder = config.decoder()?;
    let source = session::build_source(config)?;

    let mut cfg = config.capture_config();
    cfg.duration_ms = window_ms;
    // The meter wants the whole window even over a quiet line.
    cfg.idle_timeout_ms = window_ms.max(cfg.idle_timeout_ms);
    let bytes_per_second = u64::from(config.sample_rate)
        * u64::from(config.channels)
        * config.wire_sample_width()?.bytes() as u64;
    cfg.max_bytes =
        (bytes_per_second.saturating_mul(window_ms + 999) / 1_000) as usize + cfg.chunk_bytes;

    let result = capture::run_capture(source, None, &decoder, &cfg)?;
    let samples = decoder.gate_view(&result.bytes);
    Ok(MeterReading {
        rms_db: rms_db(&samples),
        peak_db: peak_db(&samples),
    })
}

fn recommend_threshold(ambient_db: f32, signal_db: f32) -> (f32, Option<&'static str>) {
    if signal_db <= ambient_db {
        let suggested = (ambient_db + 1.0).clamp(RECOMMENDED_FLOOR_DB, RECOMMENDED_CEILING_DB);
        return (
            suggested,
            Some("Signal is not louder than line noise; results may be unreliable."),
        );
    }

    let margin = signal_db - ambient_db;
    let guard = if margin >= 12.0 {
        6.0
    } else if margin >= 6.0 {
        3.0
    } else {
        1.5
    };

    let mut suggested = ambient_db + guard;
    if suggested > signal_db - 1.0 {
        suggested = (ambient_db + signal_db) / 2.0;
    }

    let warning = if margin < 6.0 {
        Some("Signal is close to line noise; check wiring or raise the board's gain.")
    } else {
        None
    };

    (
        suggested.clamp(RECOMMENDED_FLOOR_DB, RECOMMENDED_CEILING_DB),
        warning,
    )
}

fn validate_window_ms(value: u64) -> Result<()> {
    if !(MIN_METER_WINDOW_MS..=MAX_METER_WINDOW_MS).contains(&value) {
        return Err(anyhow!(
            "--meter-window-ms must be between {MIN_METER_WINDOW_MS} and {MAX_METER_WINDOW_MS} ms"
        ));
    }
    Ok(())
}

/// Two-phase level check over the live transport: line noise first, then
/// signal, ending in a suggested energy-gate threshold.
pub fn run_meter(config: &AppConfig) -> Result<()> {
    validate_window_ms(config.meter_window_ms)?;

    let window_ms = config.meter_window_ms;
    println!(
        "Line meter: {} source, {} Hz, {} byte(s) per sample",
        config.source, config.sample_rate, config.sample_width
    );

    println!(
        "Sampling line noise for {:.1}s... keep the audio source idle.",
        window_ms as f32 / 1000.0
    );
    io::stdout().flush().ok();
    let ambient = measure(config, window_ms)?;

    println!(
        "Sampling signal for {:.1}s... start the audio source.",
        window_ms as f32 / 1000.0
    );
    io::stdout().flush().ok();
    let signal = measure(config, window_ms)?;

    println!("\nResults (dBFS)");
    println!(
        "Line noise: RMS {ambient_rms:.1} dB, Peak {ambient_peak:.1} dB",
        ambient_rms = ambient.rms_db,
        ambient_peak = ambient.peak_db
    );
    println!(
        "Signal:     RMS {signal_rms:.1} dB, Peak {signal_peak:.1} dB",
        signal_rms = signal.rms_db,
        signal_peak = signal.peak_db
    );

    let (suggested, warning) = recommend_threshold(ambient.rms_db, signal.rms_db);
    println!("\nSuggested --gate-threshold-db: {suggested:.1}");
    println!("Example: wavetap --gate energy --gate-threshold-db {suggested:.1}");

    if let Some(message) = warning {
        println!("Note: {message}");
    }

    Ok(())
}
