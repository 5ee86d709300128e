//! Output devices driving the render state

use crate::error::EngineError;
use crate::render::{RenderState, SharedRenderState};
use crate::voice::VoiceBank;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::time::Duration;
use tracing::{error, info, warn};

/// A sink that pulls frames from the render state
pub trait OutputDevice {
    fn sample_rate(&self) -> u32;

    /// Whether the device exposes a clock voices can be scheduled against
    fn has_clock(&self) -> bool;

    fn is_running(&self) -> bool;

    /// Start or resume pulling audio
    fn resume(&mut self) -> Result<(), EngineError>;

    fn suspend(&mut self);

    /// Called from the control loop with the wall time since the last call.
    /// Devices with their own callback thread ignore it.
    fn pump(&mut self, _elapsed: Duration) {}
}

/// The default cpal output device
pub struct CpalOutput {
    stream: cpal::Stream,
    sample_rate: u32,
    running: bool,
}

impl CpalOutput {
    /// Open the default output device and build a render state at its rate
    pub fn open(bank: VoiceBank) -> Result<(Self, SharedRenderState), EngineError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| EngineError::DeviceUnavailable("no audio output device found".into()))?;

        let config = device.default_output_config().map_err(|e| {
            EngineError::DeviceUnavailable(format!("failed to get audio config: {}", e))
        })?;

        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;

        let render = RenderState::new(sample_rate, bank).into_shared();
        let render_for_callback = SharedRenderState::clone(&render);

        // Pre-allocated stereo buffer (avoid allocation in audio callback)
        let mut stereo_buffer = vec![0.0f32; 16384];

        let stream = device
            .build_output_stream(
                &config.into(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels.max(1);
                    let stereo_len = frames * 2;
                    if stereo_buffer.len() < stereo_len {
                        stereo_buffer.resize(stereo_len, 0.0);
                    }
                    let stereo = &mut stereo_buffer[..stereo_len];

                    // Use try_lock to avoid blocking the real-time audio thread.
                    // On contention (rare), output silence rather than blocking.
                    match render_for_callback.try_lock() {
                        Some(mut state) => state.render(stereo),
                        None => stereo.fill(0.0),
                    }

                    for (out, pair) in data.chunks_mut(channels.max(1)).zip(stereo.chunks_exact(2)) {
                        if out.len() == 1 {
                            out[0] = (pair[0] + pair[1]) * 0.5;
                        } else {
                            out[0] = pair[0];
                            out[1] = pair[1];
                            out[2..].fill(0.0);
                        }
                    }
                },
                |err| {
                    error!(%err, "audio stream error");
                },
                None,
            )
            .map_err(|e| EngineError::DeviceUnavailable(format!("failed to create audio stream: {}", e)))?;

        info!(sample_rate, channels, "audio output opened");

        let mut output = Self {
            stream,
            sample_rate,
            running: false,
        };
        output.resume()?;
        Ok((output, render))
    }
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn has_clock(&self) -> bool {
        true
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        self.stream
            .play()
            .map_err(|e| EngineError::DeviceUnavailable(format!("failed to start audio: {}", e)))?;
        self.running = true;
        Ok(())
    }

    fn suspend(&mut self) {
        if let Err(e) = self.stream.pause() {
            warn!(error = %e, "failed to suspend audio stream");
        }
        self.running = false;
    }
}

/// Silent stand-in used when no device can be opened.
///
/// Renders (and discards) as many frames as wall time elapsed, so the
/// transport, beat notifications and track end keep working.
pub struct NullOutput {
    render: SharedRenderState,
    sample_rate: u32,
    running: bool,
    carry: f64,
    scratch: Vec<f32>,
}

impl NullOutput {
    const CHUNK_FRAMES: usize = 1024;

    pub fn new(render: SharedRenderState) -> Self {
        let sample_rate = render.lock().sample_rate();
        Self {
            render,
            sample_rate,
            running: true,
            carry: 0.0,
            scratch: vec![0.0; Self::CHUNK_FRAMES * 2],
        }
    }
}

impl OutputDevice for NullOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn has_clock(&self) -> bool {
        false
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        self.running = true;
        Ok(())
    }

    fn suspend(&mut self) {
        self.running = false;
    }

    fn pump(&mut self, elapsed: Duration) {
        if !self.running {
            return;
        }
        let wanted = elapsed.as_secs_f64() * self.sample_rate as f64 + self.carry;
        let mut frames = wanted.floor() as usize;
        self.carry = wanted - frames as f64;

        let mut state = self.render.lock();
        while frames > 0 {
            let chunk = frames.min(Self::CHUNK_FRAMES);
            state.render(&mut self.scratch[..chunk * 2]);
            frames -= chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_output_follows_wall_time() {
        let render = RenderState::new(1000, VoiceBank::new()).into_shared();
        let mut output = NullOutput::new(SharedRenderState::clone(&render));
        assert!(!output.has_clock());

        output.pump(Duration::from_millis(2500));
        assert_eq!(render.lock().clock(), 2500);

        output.suspend();
        output.pump(Duration::from_millis(100));
        assert_eq!(render.lock().clock(), 2500);
    }

    #[test]
    fn test_null_output_carries_fractional_frames() {
        let render = RenderState::new(10, VoiceBank::new()).into_shared();
        let mut output = NullOutput::new(SharedRenderState::clone(&render));
        for _ in 0..4 {
            output.pump(Duration::from_millis(250));
        }
        assert_eq!(render.lock().clock(), 10);
    }
}
