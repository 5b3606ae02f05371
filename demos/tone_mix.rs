use anyhow::Result;
use petalmix::*;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

/// Mono sine oscillator. Stateless: the phase is derived from the render timestamp.
struct Tone {
    frequency: f32,
    sample_rate: u32,
}

impl AudioSource for Tone {
    fn render(&self, timestamp: u64, frames: usize, audio: &mut [f32]) -> std::result::Result<(), RenderError> {
        let step = self.frequency / self.sample_rate as f32;
        for (i, sample) in audio.iter_mut().take(frames).enumerate() {
            let phase = ((timestamp + i as u64) as f32 * step).fract();
            *sample = (phase * TAU).sin() * 0.2;
        }
        Ok(())
    }

    fn format(&self) -> Option<AudioFormat> {
        Some(AudioFormat::mono(self.sample_rate))
    }
}

/// Logs the render clock once per second of audio.
struct Clock {
    sample_rate: u64,
    next: u64,
}

impl TimingObserver for Clock {
    fn observe(&mut self, phase: RenderPhase, timestamp: u64, _frames: usize) {
        if phase == RenderPhase::PostRender && timestamp >= self.next {
            self.next += self.sample_rate;
            log::debug!("Rendered {} s", timestamp / self.sample_rate);
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let desc = PetalMixDesc::new().sample_rate(48000).block_size(512);
    let engine = PetalMixEngine::new(desc.clone(), CpalBackend::new())?;

    let low: Arc<dyn AudioSource> = Arc::new(Tone {
        frequency: 220.0,
        sample_rate: desc.sample_rate,
    });
    let high: Arc<dyn AudioSource> = Arc::new(Tone {
        frequency: 330.0,
        sample_rate: desc.sample_rate,
    });

    let group = engine.create_group(GroupId::TOP)?;
    engine.add_channels(&[low.clone(), high.clone()], group)?;
    engine.set_pan(&low, -0.8)?;
    engine.set_pan(&high, 0.8)?;
    engine.set_metering(GroupId::TOP, true)?;
    engine.add_timing_observer(Clock {
        sample_rate: u64::from(desc.sample_rate),
        next: 0,
    })?;

    engine.start()?;
    log::info!("Playing a two-tone mix");

    for step in 0..40 {
        std::thread::sleep(Duration::from_millis(100));
        if step == 20 {
            log::info!("Muting the high tone");
            engine.set_muted(&high, true)?;
        }
        for event in engine.poll_events() {
            log::info!("Event: {:?}", event);
        }
        if step % 10 == 9 {
            let levels = engine.output_levels();
            log::info!(
                "Output level: {:.1} dB average, {:.1} dB peak",
                levels.average_db,
                levels.peak_db
            );
        }
    }

    engine.stop()?;
    log::info!("Session: {:?}", engine.session_info());
    Ok(())
}
