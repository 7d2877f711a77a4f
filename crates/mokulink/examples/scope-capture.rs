//! Capture a few oscilloscope frames while the embedded generator drives
//! output 1.
//!
//! Run with:
//!   cargo run -p mokulink --example scope-capture --features logging -- 192.168.73.1:27184

use std::time::Duration;

use mokulink::logging::{init_logging, LogFormat, LogLevel};
use mokulink::{
    connect, Channel, Edge, Oscilloscope, SessionConfig, SineWave, Synthesizer, TriggerSource,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::Text, LogLevel::Info);
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "192.168.73.1:27184".to_string());

    let session = connect(addr.as_str(), SessionConfig::default())?;
    let scope = session.attach_instrument(Oscilloscope::new())?;

    scope.configure(|osc| {
        osc.set_timebase(-1e-3, 1e-3)?;
        osc.set_trigger(TriggerSource::Output(Channel::Ch1), Edge::Rising, 0.0)?;
        osc.synth_sinewave(Channel::Ch1, SineWave::new(1.0, 2e3))
    })?;
    let receipt = scope.commit()?;
    eprintln!("Committed {} fields at epoch {}", receipt.fields.len(), receipt.epoch);

    for _ in 0..5 {
        let frame = scope.get_frame(Duration::from_secs(2))?;
        let ch1 = frame.channel(Channel::Ch1).unwrap_or_default();
        let peak = ch1
            .iter()
            .flatten()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()));
        eprintln!(
            "Frame {}: {} samples, ch1 peak {peak:.3} V",
            frame.header.frame_id,
            frame.samples_per_channel()
        );
    }

    session.close()?;
    Ok(())
}
