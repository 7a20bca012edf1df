//! Synthetic audio source: a 1 kHz tone encoded as PCMU.
//!
//! Stands in for a microphone on headless clients so a call carries real
//! RTP audio that the remote side can hear.

/// Samples per 20 ms frame at 8 kHz.
pub const SAMPLES_PER_FRAME: usize = 160;

/// Frame duration matching [`SAMPLES_PER_FRAME`].
pub const FRAME_DURATION: std::time::Duration = std::time::Duration::from_millis(20);

/// Generates sine wave frames.
pub struct ToneGenerator {
    phase: f64,
    frequency: f64,
    sample_rate: f64,
    amplitude: f64,
}

impl ToneGenerator {
    /// 1 kHz at 8 kHz sample rate, -2 dBFS.
    pub fn new() -> Self {
        Self {
            phase: 0.0,
            frequency: 1000.0,
            sample_rate: 8000.0,
            amplitude: 0.8,
        }
    }

    /// Generate the next 20 ms frame of linear PCM.
    pub fn next_frame(&mut self) -> Vec<i16> {
        let two_pi = 2.0 * std::f64::consts::PI;
        let phase_inc = two_pi * self.frequency / self.sample_rate;
        let mut samples = Vec::with_capacity(SAMPLES_PER_FRAME);
        for _ in 0..SAMPLES_PER_FRAME {
            samples.push((self.phase.sin() * self.amplitude * 32767.0) as i16);
            self.phase += phase_inc;
            if self.phase > two_pi {
                self.phase -= two_pi;
            }
        }
        samples
    }

    /// Generate the next frame already encoded as PCMU.
    pub fn next_pcmu(&mut self) -> Vec<u8> {
        self.next_frame().into_iter().map(linear_to_ulaw).collect()
    }
}

impl Default for ToneGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// One PCMU frame of silence (0xFF decodes to ~0).
pub fn silence_pcmu() -> Vec<u8> {
    vec![0xFF; SAMPLES_PER_FRAME]
}

/// Encode a 16-bit linear PCM sample to 8-bit mu-law (ITU-T G.711).
pub fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i16 = 0x84;
    const CLIP: i16 = 32635;

    let (sign, mag) = if sample < 0 {
        // -(-32768) overflows; it is clipped anyway.
        let mag = if sample == i16::MIN { CLIP } else { -sample };
        (0x80u8, mag)
    } else {
        (0u8, sample)
    };
    let mag = mag.min(CLIP) + BIAS;

    // Segment is the position of the leading bit of the biased magnitude.
    let mut exponent: u8 = 7;
    let mut exp_mask: i16 = 0x4000;
    while exponent > 0 && (mag & exp_mask) == 0 {
        exponent -= 1;
        exp_mask >>= 1;
    }
    let mantissa = ((mag >> (exponent as i16 + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_generator_output() {
        let mut gen = ToneGenerator::new();
        let frame = gen.next_frame();
        assert_eq!(frame.len(), SAMPLES_PER_FRAME);
        // Should swing both ways (sine wave)
        assert!(frame.iter().any(|&s| s > 1000));
        assert!(frame.iter().any(|&s| s < -1000));
    }

    #[test]
    fn test_pcmu_frame_is_not_silence() {
        let mut gen = ToneGenerator::new();
        let frame = gen.next_pcmu();
        assert_eq!(frame.len(), SAMPLES_PER_FRAME);
        assert_ne!(frame, silence_pcmu());
    }

    #[test]
    fn test_ulaw_known_values() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(i16::MIN), 0x00);
    }
}
