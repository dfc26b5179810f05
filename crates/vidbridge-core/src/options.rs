//! Transcode options and the codec/format catalogs.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Video encoders the engine build ships with.
pub const VIDEO_CODECS: &[&str] = &["h264", "h265", "vp8", "vp9", "av1", "mpeg4"];

/// Audio encoders the engine build ships with.
pub const AUDIO_CODECS: &[&str] = &["aac", "mp3", "opus", "vorbis", "flac"];

/// Container formats the engine build can mux.
pub const OUTPUT_FORMATS: &[&str] = &["mp4", "webm", "mkv", "mov", "avi", "mp3", "ogg", "wav"];

/// MIME type for an output format.
pub fn mime_type(format: &str) -> &'static str {
    match format {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// Name for the transcoded file: the input's stem with the new extension.
///
/// ```
/// use vidbridge_core::options::output_file_name;
///
/// assert_eq!(output_file_name(Some("clip.mov"), "webm"), "clip.webm");
/// assert_eq!(output_file_name(None, "mp4"), "output.mp4");
/// ```
pub fn output_file_name(input_name: Option<&str>, format: &str) -> String {
    match input_name.and_then(|name| name.rfind('.').map(|dot| &name[..dot])) {
        Some(stem) if !stem.is_empty() => format!("{}.{}", stem, format),
        _ => format!("output.{}", format),
    }
}

/// Resolution value that keeps the source frame size.
pub const SAME_RESOLUTION: &str = "same";

/// Named resolutions the engine understands, with their frame sizes.
pub const RESOLUTION_PRESETS: &[(&str, u32, u32)] = &[
    ("360p", 640, 360),
    ("480p", 854, 480),
    ("720p", 1280, 720),
    ("1080p", 1920, 1080),
];

/// Parameters of one transcode call.
///
/// Bitrates and the resolution text are passed to the engine unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeOptions {
    pub output_format: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate: i32,
    pub audio_bitrate: i32,
    /// `same`, a preset such as `720p`, `WIDTHxHEIGHT`, or any size
    /// expression the engine accepts
    pub resolution: String,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            output_format: "mp4".to_string(),
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            video_bitrate: 1_000_000,
            audio_bitrate: 128_000,
            resolution: SAME_RESOLUTION.to_string(),
        }
    }
}

impl TranscodeOptions {
    pub fn new(output_format: impl Into<String>) -> Self {
        Self {
            output_format: output_format.into(),
            ..Self::default()
        }
    }

    pub fn video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video_codec = codec.into();
        self
    }

    pub fn audio_codec(mut self, codec: impl Into<String>) -> Self {
        self.audio_codec = codec.into();
        self
    }

    pub fn bitrates(mut self, video: i32, audio: i32) -> Self {
        self.video_bitrate = video;
        self.audio_bitrate = audio;
        self
    }

    pub fn resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = resolution.into();
        self
    }

    /// Scale to `width` x `height`.
    pub fn frame_size(self, width: u32, height: u32) -> Self {
        self.resolution(format!("{}x{}", width, height))
    }

    /// Check the options can cross the boundary as C strings and integers.
    ///
    /// Codec and format names are not checked against the catalogs; the
    /// engine reports unknown names itself.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("output_format", &self.output_format),
            ("video_codec", &self.video_codec),
            ("audio_codec", &self.audio_codec),
        ] {
            if value.is_empty() {
                return Err(BridgeError::InvalidOptions(format!("{} is empty", name)));
            }
            if value.contains('\0') {
                return Err(BridgeError::InvalidOptions(format!(
                    "{} contains a NUL byte",
                    name
                )));
            }
        }
        if self.resolution.contains('\0') {
            return Err(BridgeError::InvalidOptions(
                "resolution contains a NUL byte".to_string(),
            ));
        }
        if self.video_bitrate < 0 || self.audio_bitrate < 0 {
            return Err(BridgeError::InvalidOptions(
                "bitrates must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_is_kept_verbatim() {
        for text in ["same", "720p", "1280x720", "-1x720", "iw/2:ih/2", ""] {
            let options = TranscodeOptions::default().resolution(text);
            options.validate().unwrap();
            assert_eq!(options.resolution, text);
        }
        assert_eq!(
            TranscodeOptions::default().frame_size(1280, 720).resolution,
            "1280x720"
        );
    }

    #[test]
    fn test_options_validate() {
        TranscodeOptions::default().validate().unwrap();

        let nul = TranscodeOptions::new("mp\04");
        assert!(matches!(nul.validate(), Err(BridgeError::InvalidOptions(_))));

        let empty = TranscodeOptions::default().video_codec("");
        assert!(empty.validate().is_err());

        let negative = TranscodeOptions::default().bitrates(-1, 128_000);
        assert!(negative.validate().is_err());

        let nul_resolution = TranscodeOptions::default().resolution("720\0p");
        assert!(nul_resolution.validate().is_err());
    }

    #[test]
    fn test_options_from_json_uses_defaults() {
        let options: TranscodeOptions =
            serde_json::from_str(r#"{"output_format": "webm", "resolution": "720p"}"#).unwrap();
        assert_eq!(options.output_format, "webm");
        assert_eq!(options.video_codec, "h264");
        assert_eq!(options.resolution, "720p");
    }

    #[test]
    fn test_mime_type() {
        assert_eq!(mime_type("mkv"), "video/x-matroska");
        assert_eq!(mime_type("unknown"), "application/octet-stream");
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name(Some("movie.final.mp4"), "mkv"), "movie.final.mkv");
        assert_eq!(output_file_name(Some("noext"), "mp4"), "output.mp4");
        assert_eq!(output_file_name(Some(".hidden"), "mp4"), "output.mp4");
    }

    #[test]
    fn test_catalogs() {
        assert!(VIDEO_CODECS.contains(&"vp9"));
        assert!(AUDIO_CODECS.contains(&"opus"));
        assert!(OUTPUT_FORMATS.contains(&"webm"));
        assert!(RESOLUTION_PRESETS.iter().any(|(name, _, _)| *name == "720p"));
    }
}
