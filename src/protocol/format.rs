//! Audio formats offered by the synthesis service.

use serde::{Deserialize, Serialize};

/// Output format requested in `run-task`.
///
/// Each variant fixes the container/codec, sample rate and bit rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioFormat {
    #[serde(rename = "default")]
    Default,

    #[serde(rename = "wav_8000hz_mono_16bit")]
    Wav8000HzMono16Bit,
    #[serde(rename = "wav_16000hz_mono_16bit")]
    Wav16000HzMono16Bit,
    #[serde(rename = "wav_22050hz_mono_16bit")]
    Wav22050HzMono16Bit,
    #[serde(rename = "wav_24000hz_mono_16bit")]
    Wav24000HzMono16Bit,
    #[serde(rename = "wav_44100hz_mono_16bit")]
    Wav44100HzMono16Bit,
    #[serde(rename = "wav_48000hz_mono_16bit")]
    Wav48000HzMono16Bit,

    #[serde(rename = "mp3_8000hz_mono_128kbps")]
    Mp38000HzMono128Kbps,
    #[serde(rename = "mp3_16000hz_mono_128kbps")]
    Mp316000HzMono128Kbps,
    #[serde(rename = "mp3_22050hz_mono_256kbps")]
    Mp322050HzMono256Kbps,
    #[serde(rename = "mp3_24000hz_mono_256kbps")]
    Mp324000HzMono256Kbps,
    #[serde(rename = "mp3_44100hz_mono_256kbps")]
    Mp344100HzMono256Kbps,
    #[serde(rename = "mp3_48000hz_mono_256kbps")]
    Mp348000HzMono256Kbps,

    #[serde(rename = "pcm_8000hz_mono_16bit")]
    Pcm8000HzMono16Bit,
    #[serde(rename = "pcm_16000hz_mono_16bit")]
    Pcm16000HzMono16Bit,
    #[serde(rename = "pcm_22050hz_mono_16bit")]
    Pcm22050HzMono16Bit,
    #[serde(rename = "pcm_24000hz_mono_16bit")]
    Pcm24000HzMono16Bit,
    #[serde(rename = "pcm_44100hz_mono_16bit")]
    Pcm44100HzMono16Bit,
    #[serde(rename = "pcm_48000hz_mono_16bit")]
    Pcm48000HzMono16Bit,

    #[serde(rename = "opus_8khz_mono_16kbps")]
    Opus8KhzMono16Kbps,
    #[serde(rename = "opus_8khz_mono_32kbps")]
    Opus8KhzMono32Kbps,
    #[serde(rename = "opus_16khz_mono_16kbps")]
    Opus16KhzMono16Kbps,
    #[serde(rename = "opus_16khz_mono_32kbps")]
    Opus16KhzMono32Kbps,
    #[serde(rename = "opus_16khz_mono_64kbps")]
    Opus16KhzMono64Kbps,
    #[serde(rename = "opus_24khz_mono_16kbps")]
    Opus24KhzMono16Kbps,
    #[serde(rename = "opus_24khz_mono_32kbps")]
    Opus24KhzMono32Kbps,
    #[serde(rename = "opus_24khz_mono_64kbps")]
    Opus24KhzMono64Kbps,
    #[serde(rename = "opus_48khz_mono_16kbps")]
    Opus48KhzMono16Kbps,
    #[serde(rename = "opus_48khz_mono_32kbps")]
    Opus48KhzMono32Kbps,
    #[serde(rename = "opus_48khz_mono_64kbps")]
    Opus48KhzMono64Kbps,
}

impl AudioFormat {
    /// (format, sample rate, bit rate) as announced on the wire.
    ///
    /// `Default` is resolved to mp3 at 22050 Hz.
    fn spec(self) -> (&'static str, u32, u32) {
        use AudioFormat::*;
        match self {
            Default => ("mp3", 22050, 0),

            Wav8000HzMono16Bit => ("wav", 8000, 16),
            Wav16000HzMono16Bit => ("wav", 16000, 16),
            Wav22050HzMono16Bit => ("wav", 22050, 16),
            Wav24000HzMono16Bit => ("wav", 24000, 16),
            Wav44100HzMono16Bit => ("wav", 44100, 16),
            Wav48000HzMono16Bit => ("wav", 48000, 16),

            Mp38000HzMono128Kbps => ("mp3", 8000, 128),
            Mp316000HzMono128Kbps => ("mp3", 16000, 128),
            Mp322050HzMono256Kbps => ("mp3", 22050, 256),
            Mp324000HzMono256Kbps => ("mp3", 24000, 256),
            Mp344100HzMono256Kbps => ("mp3", 44100, 256),
            Mp348000HzMono256Kbps => ("mp3", 48000, 256),

            Pcm8000HzMono16Bit => ("pcm", 8000, 16),
            Pcm16000HzMono16Bit => ("pcm", 16000, 16),
            Pcm22050HzMono16Bit => ("pcm", 22050, 16),
            Pcm24000HzMono16Bit => ("pcm", 24000, 16),
            Pcm44100HzMono16Bit => ("pcm", 44100, 16),
            Pcm48000HzMono16Bit => ("pcm", 48000, 16),

            Opus8KhzMono16Kbps => ("opus", 8000, 16),
            Opus8KhzMono32Kbps => ("opus", 8000, 32),
            Opus16KhzMono16Kbps => ("opus", 16000, 16),
            Opus16KhzMono32Kbps => ("opus", 16000, 32),
            Opus16KhzMono64Kbps => ("opus", 16000, 64),
            Opus24KhzMono16Kbps => ("opus", 24000, 16),
            Opus24KhzMono32Kbps => ("opus", 24000, 32),
            Opus24KhzMono64Kbps => ("opus", 24000, 64),
            Opus48KhzMono16Kbps => ("opus", 48000, 16),
            Opus48KhzMono32Kbps => ("opus", 48000, 32),
            Opus48KhzMono64Kbps => ("opus", 48000, 64),
        }
    }

    /// Container/codec name sent as `parameters.format`.
    pub fn format(self) -> &'static str {
        self.spec().0
    }

    pub fn sample_rate(self) -> u32 {
        self.spec().1
    }

    pub fn channels(self) -> &'static str {
        "mono"
    }

    /// Nominal bit rate (bits per sample for wav/pcm, kbps for compressed formats).
    pub fn bit_rate(self) -> u32 {
        self.spec().2
    }

    pub fn is_opus(self) -> bool {
        self.format() == "opus"
    }

    /// True for raw 16-bit PCM, the only format the playback process accepts.
    pub fn is_raw_pcm(self) -> bool {
        self.format() == "pcm"
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} with {}Hz sample rate, {} channel, {}",
            self.format().to_uppercase(),
            self.sample_rate(),
            self.channels(),
            self.bit_rate()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_resolves_to_mp3_22050() {
        assert_eq!(AudioFormat::Default.format(), "mp3");
        assert_eq!(AudioFormat::Default.sample_rate(), 22050);
    }

    #[test]
    fn pcm_16k_is_raw_pcm() {
        let format = AudioFormat::Pcm16000HzMono16Bit;
        assert_eq!(format.format(), "pcm");
        assert_eq!(format.sample_rate(), 16000);
        assert_eq!(format.bit_rate(), 16);
        assert!(format.is_raw_pcm());
        assert!(!format.is_opus());
    }

    #[test]
    fn opus_reports_kbps() {
        let format = AudioFormat::Opus24KhzMono64Kbps;
        assert!(format.is_opus());
        assert_eq!(format.sample_rate(), 24000);
        assert_eq!(format.bit_rate(), 64);
    }

    #[test]
    fn deserializes_from_config_name() {
        let format: AudioFormat = serde_json::from_str(r#""pcm_16000hz_mono_16bit""#).unwrap();
        assert_eq!(format, AudioFormat::Pcm16000HzMono16Bit);
    }

    #[test]
    fn display_mentions_rate() {
        let text = AudioFormat::Wav24000HzMono16Bit.to_string();
        assert_eq!(text, "WAV with 24000Hz sample rate, mono channel, 16");
    }
}
