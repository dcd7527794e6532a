use std::time::Duration;

use crate::profile::Profile;

const PCM_BYTES_PER_SECOND: u64 = 48_000 * 2 * 2;
const CONTAINER_OVERHEAD: u64 = 64 * 1024;

/// Upper bound of the encoded size of `source_duration` of audio.
///
/// Used to announce a length before the encoder has finished. Profiles
/// without a bitrate are treated as 16-bit stereo PCM at 48 kHz; lossy
/// profiles get a quarter of headroom for variable bitrate overshoot.
pub fn expected_output_size(profile: &Profile, source_duration: Duration) -> u64 {
    let remaining = source_duration.saturating_sub(profile.seek());
    let mut seconds = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        seconds += 1;
    }

    let per_second = match profile.bitrate() {
        0 => PCM_BYTES_PER_SECOND,
        kbps => (u64::from(kbps) * 1000 / 8) * 5 / 4,
    };
    seconds.saturating_mul(per_second).saturating_add(CONTAINER_OVERHEAD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ProfileRegistry, pcm16le};

    #[test]
    fn pcm_uses_raw_sample_rate() {
        let size = expected_output_size(&pcm16le(), Duration::from_secs(10));
        assert_eq!(size, 10 * 192_000 + 64 * 1024);
    }

    #[test]
    fn lossy_rounds_seconds_up_with_headroom() {
        let mp3 = ProfileRegistry::builtin().lookup("mp3").unwrap().with_bitrate(320);
        let size = expected_output_size(&mp3, Duration::from_millis(2_100));
        assert_eq!(size, 3 * 50_000 + 64 * 1024);
    }

    #[test]
    fn seek_shortens_the_estimate() {
        let opus = ProfileRegistry::builtin().lookup("opus").unwrap();
        let full = expected_output_size(&opus, Duration::from_secs(60));
        let seeked = expected_output_size(&opus.with_seek(Duration::from_secs(30)), Duration::from_secs(60));
        assert!(seeked < full);

        let past_end = ProfileRegistry::builtin()
            .lookup("opus")
            .unwrap()
            .with_seek(Duration::from_secs(90));
        assert_eq!(expected_output_size(&past_end, Duration::from_secs(60)), 64 * 1024);
    }
}
