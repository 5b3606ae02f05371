use crate::error::RenderError;
use crate::source::AudioSource;

/// Converts a source's channel layout to its group's layout.
///
/// Mono is duplicated to every output channel, anything rendered to a mono group is
/// averaged, and other combinations map output channel `c` from input channel
/// `c % input_channels`.
#[derive(Debug)]
pub struct ChannelMapper {
    input_channels: usize,
    scratch: Vec<f32>,
}

impl ChannelMapper {
    /// Allocates scratch for up to `max_frames` frames of `input_channels` channels.
    pub fn new(input_channels: u16, max_frames: usize) -> Self {
        let input_channels = usize::from(input_channels.max(1));
        Self {
            input_channels,
            scratch: vec![0.0; input_channels * max_frames],
        }
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Renders `source` into the scratch buffer and maps it into `audio`.
    pub fn render(
        &mut self,
        source: &dyn AudioSource,
        timestamp: u64,
        frames: usize,
        audio: &mut [f32],
    ) -> Result<(), RenderError> {
        let input_len = frames * self.input_channels;
        if input_len > self.scratch.len() || frames == 0 {
            return Err(RenderError::Failed);
        }
        let input = &mut self.scratch[..input_len];
        input.fill(0.0);
        source.render(timestamp, frames, input)?;
        map_channels(input, self.input_channels, audio, audio.len() / frames);
        Ok(())
    }
}

pub(crate) fn map_channels(input: &[f32], in_channels: usize, output: &mut [f32], out_channels: usize) {
    if in_channels == 0 || out_channels == 0 {
        return;
    }
    let frames = (input.len() / in_channels).min(output.len() / out_channels);
    for frame in 0..frames {
        let src = &input[frame * in_channels..(frame + 1) * in_channels];
        let dst = &mut output[frame * out_channels..(frame + 1) * out_channels];
        if out_channels == 1 {
            dst[0] = src.iter().sum::<f32>() / in_channels as f32;
        } else {
            for (c, sample) in dst.iter_mut().enumerate() {
                *sample = src[c % in_channels];
            }
        }
    }
}
