use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Formats the given [Duration] as "MM:SSs"
pub fn format_time(t: Duration) -> String {
    let minutes = t.as_secs() / 60;
    let seconds = t.as_secs() % 60;
    format!("{:02}:{:02}s", minutes, seconds)
}

/// Formats a duration in seconds to a short human-readable string, e.g. "4.5s", "2.1m".
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        format!("{:.1}m", seconds / 60.0)
    } else {
        format!("{:.1}h", seconds / 3600.0)
    }
}

/// Parses a time string into seconds.
///
/// Supported formats:
///
/// * `HH:MM:SS[.frac]`
/// * `MM:SS[.frac]`
/// * plain seconds, integer or decimal (e.g. `90`, `14.5`)
///
/// Invalid input fails with [Error::InvalidTime](crate::Error::InvalidTime).
pub fn parse_time_string(s: &str) -> crate::Result<f64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidTime(s.to_string()));
    }

    let parse_component = |c: &str, allow_frac: bool| -> crate::Result<f64> {
        let valid = !c.is_empty()
            && c.chars().all(|ch| ch.is_ascii_digit() || ch == '.')
            && c.matches('.').count() <= usize::from(allow_frac);
        if !valid {
            return Err(crate::Error::InvalidTime(s.to_string()));
        }
        c.parse::<f64>()
            .map_err(|_| crate::Error::InvalidTime(s.to_string()))
    };

    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [secs] => parse_component(secs, true),
        [mins, secs] => {
            let minutes = parse_component(mins, false)?;
            let seconds = parse_component(secs, true)?;
            Ok(minutes * 60.0 + seconds)
        }
        [hours, mins, secs] => {
            let hours = parse_component(hours, false)?;
            let minutes = parse_component(mins, false)?;
            let seconds = parse_component(secs, true)?;
            Ok(hours * 3600.0 + minutes * 60.0 + seconds)
        }
        _ => Err(crate::Error::InvalidTime(s.to_string())),
    }
}

/// Checks if the given path points to a valid video file.
///
/// If `full` is set to **false**, only the file header will be checked. This is a very cheap
/// operation, but it does not guarantee validity. If set to **true**, FFmpeg will be used to
/// check the video contents - note that this is more expensive, but much more accurate.
pub fn is_valid_video_file(path: impl AsRef<Path>, full: bool) -> bool {
    if !full {
        let mut buf = [0u8; 8192];
        let mut f = match std::fs::File::open(path.as_ref()) {
            Ok(f) => f,
            Err(_) => return false,
        };
        if f.read(&mut buf).is_err() {
            return false;
        }
        return infer::is_video(&buf);
    }

    if let Ok(input) = ffmpeg_next::format::input(&path.as_ref()) {
        input
            .streams()
            .filter(|s| s.parameters().medium() == ffmpeg_next::util::media::Type::Video)
            .count()
            > 0
    } else {
        false
    }
}

/// Computes the MD5 checksum of the first 8 KiB of the file.
///
/// Recorded in metadata sidecars so stale sidecars can be detected cheaply.
pub fn compute_header_md5sum(video: impl AsRef<Path>) -> crate::Result<String> {
    let mut buf = [0u8; 8192];
    let mut f = std::fs::File::open(video.as_ref())?;
    f.read_exact(&mut buf)?;
    let hash = format!("{:x}", md5::compute(buf));
    Ok(hash)
}

/// Returns the underlying FFmpeg version integer used by seamloop.
pub fn ffmpeg_version() -> u32 {
    ffmpeg_next::util::version()
}

/// Returns the underlying FFmpeg version string used by seamloop.
pub fn ffmpeg_version_string() -> String {
    let version_int = ffmpeg_version();

    // Reference: https://github.com/FFmpeg/FFmpeg/blob/130d19bf2044ac76372d1b97ab87ab283c8b37f8/libavutil/version.h#L64
    format!(
        "{}.{}.{}",
        version_int >> 16, // MAJOR
        (version_int & 0x00FF00) >> 8, // MINOR
        version_int & 0xFF // MICRO
    )
}

/// Host capabilities, for reporting only.
///
/// Detection behaviour and results never depend on any of these values.
#[derive(Clone, Debug)]
pub struct Capabilities {
    /// Number of logical CPUs available to the process.
    pub cpu_threads: usize,
    /// Whether the crate was built with multi-threaded pipeline stages.
    pub threading_enabled: bool,
    /// FFmpeg version string.
    pub ffmpeg_version: String,
}

impl Capabilities {
    /// Queries the capabilities of the current host.
    pub fn detect() -> Self {
        Self {
            cpu_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            threading_enabled: cfg!(feature = "rayon"),
            ffmpeg_version: ffmpeg_version_string(),
        }
    }
}
