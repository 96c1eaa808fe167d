//! PCM stream format encoding
//!
//! The 16-bit format word shared by the converter format verb and the stream
//! descriptor FMT register: bits 3:0 channel count minus one, 6:4 sample
//! width, 13:8 sample rate (base, multiplier and divisor).

/// Sample container requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SampleFormat {
    Pcm8,
    Pcm16,
    Pcm20,
    Pcm24,
    Pcm32,
}

impl SampleFormat {
    pub const fn bits(self) -> u32 {
        match self {
            Self::Pcm8 => 8,
            Self::Pcm16 => 16,
            Self::Pcm20 => 20,
            Self::Pcm24 => 24,
            Self::Pcm32 => 32,
        }
    }

    const fn code(self) -> u16 {
        match self {
            Self::Pcm8 => 0b000,
            Self::Pcm16 => 0b001,
            Self::Pcm20 => 0b010,
            Self::Pcm24 => 0b011,
            Self::Pcm32 => 0b100,
        }
    }

    const ALL: [Self; 5] = [Self::Pcm8, Self::Pcm16, Self::Pcm20, Self::Pcm24, Self::Pcm32];
}

/// Sample rates expressible in the format word, as (hertz, rate bits)
const SAMPLE_RATES: [(u32, u16); 11] = [
    (8_000, 0b0_000_101),
    (11_025, 0b1_000_011),
    (16_000, 0b0_000_010),
    (22_050, 0b1_000_001),
    (32_000, 0b0_001_010),
    (44_100, 0b1_000_000),
    (48_000, 0b0_000_000),
    (88_200, 0b1_001_000),
    (96_000, 0b0_001_000),
    (176_400, 0b1_011_000),
    (192_000, 0b0_011_000),
];

/// Stream parameters requested by the caller
///
/// Negotiation rewrites the fields with what the hardware will actually run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            format: SampleFormat::Pcm16,
        }
    }
}

/// Encoded stream format word
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat(u16);

impl Default for PcmFormat {
    /// 48 kHz, 16-bit, stereo
    fn default() -> Self {
        Self((SampleFormat::Pcm16.code() << 4) | 1)
    }
}

impl PcmFormat {
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Channel count field (channels minus one)
    pub const fn channel_field(self) -> u8 {
        (self.0 & 0xF) as u8
    }

    pub const fn channels(self) -> u32 {
        self.channel_field() as u32 + 1
    }

    /// Select the supported rate closest to `hz`; returns the rate chosen
    pub fn set_sample_rate(&mut self, hz: u32) -> u32 {
        let mut best = SAMPLE_RATES[0];
        for entry in SAMPLE_RATES {
            if entry.0.abs_diff(hz) < best.0.abs_diff(hz) {
                best = entry;
            }
        }
        self.0 = (self.0 & !(0x7F << 8)) | (best.1 << 8);
        best.0
    }

    /// Set the channel count, clamped to 1..=16; returns the count chosen
    pub fn set_channels(&mut self, channels: u32) -> u32 {
        let channels = channels.clamp(1, 16);
        self.0 = (self.0 & !0xF) | (channels - 1) as u16;
        channels
    }

    /// Select the sample width closest to `bits`; returns the width chosen
    pub fn set_bits_per_sample(&mut self, bits: u32) -> SampleFormat {
        let mut best = SampleFormat::Pcm16;
        for format in SampleFormat::ALL {
            if format.bits().abs_diff(bits) < best.bits().abs_diff(bits) {
                best = format;
            }
        }
        self.0 = (self.0 & !(0x7 << 4)) | (best.code() << 4);
        best
    }

    /// Encode `params`, rewriting them with the values actually selected
    pub fn negotiate(params: &mut StreamParams) -> Self {
        let mut format = Self::default();
        params.sample_rate = format.set_sample_rate(params.sample_rate);
        params.channels = format.set_channels(params.channels);
        params.format = format.set_bits_per_sample(params.format.bits());
        format
    }
}
