//! HLS playlist text: master rendering, variant rewriting, completeness checks.

use std::fmt::Write;
use std::sync::LazyLock;

use m3u8_rs::{Playlist, parse_playlist_res};
use regex::Regex;

use super::ManifestError;

pub const ENDLIST_TAG: &str = "#EXT-X-ENDLIST";
pub const HLS_VERSION: u8 = 3;

static MEDIA_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[A-Za-z0-9_.\-]+\.(ts|m4s|mp4|aac|vtt|webvtt)$").expect("valid media regex")
});

/// A playlist is finished once the transcoder wrote its terminal tag.
pub fn is_finished(content: &str) -> bool {
    content.lines().any(|line| line.trim() == ENDLIST_TAG)
}

/// `1000k` -> 1_000_000, `4m` -> 4_000_000, `800000` -> 800_000.
pub fn bandwidth_for_label(label: &str) -> Option<u64> {
    let label = label.trim().to_ascii_lowercase();
    let (digits, multiplier) = match label.as_bytes().last()? {
        b'k' => (&label[..label.len() - 1], 1_000),
        b'm' => (&label[..label.len() - 1], 1_000_000),
        _ => (label.as_str(), 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

/// File name of a URI that points at a media file, if it does.
pub fn media_file_name(uri: &str) -> Option<&str> {
    let path = uri.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    MEDIA_FILE.is_match(name).then_some(name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterEntry {
    pub variant: String,
    pub bandwidth: Option<u64>,
    pub resolution: Option<(u32, u32)>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleEntry {
    pub language: String,
    pub uri: String,
}

const SUBTITLE_GROUP: &str = "subs";

/// Renders a master playlist, highest bandwidth first.
pub fn render_master(entries: &[MasterEntry], subtitles: &[SubtitleEntry]) -> String {
    let mut sorted: Vec<&MasterEntry> = entries.iter().collect();
    // Stable: unknown bandwidths keep their declared order, after the known ones.
    sorted.sort_by(|a, b| b.bandwidth.unwrap_or(0).cmp(&a.bandwidth.unwrap_or(0)));

    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:{HLS_VERSION}");

    for sub in subtitles {
        let _ = writeln!(
            out,
            "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"{SUBTITLE_GROUP}\",NAME=\"{lang}\",LANGUAGE=\"{lang}\",DEFAULT=NO,AUTOSELECT=YES,URI=\"{uri}\"",
            lang = sub.language,
            uri = sub.uri
        );
    }

    for entry in sorted {
        let mut attrs = format!("BANDWIDTH={}", entry.bandwidth.unwrap_or(0));
        if let Some((w, h)) = entry.resolution {
            let _ = write!(attrs, ",RESOLUTION={w}x{h}");
        }
        if !subtitles.is_empty() {
            let _ = write!(attrs, ",SUBTITLES=\"{SUBTITLE_GROUP}\"");
        }
        let _ = writeln!(out, "#EXT-X-STREAM-INF:{attrs}");
        let _ = writeln!(out, "{}", entry.uri);
    }

    out
}

/// Where rewritten segment URIs point.
#[derive(Debug, Clone, Copy)]
pub enum SegmentBase<'a> {
    /// Bare file name, resolved by the player against the playlist URL.
    Relative,
    /// Absolute prefix without trailing slash, e.g. a CDN-signed directory.
    Absolute(&'a str),
}

#[derive(Debug, Clone, Copy)]
pub struct RewriteOptions<'a> {
    pub key_uri: &'a str,
    pub iv_hex: &'a str,
    pub segments: SegmentBase<'a>,
}

fn rewrite_uri(uri: &str, base: SegmentBase<'_>) -> Option<String> {
    let name = media_file_name(uri)?;
    Some(match base {
        SegmentBase::Relative => name.to_string(),
        SegmentBase::Absolute(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), name),
    })
}

/// Parses a stored variant playlist and points its key and segment URIs at
/// this service (or the CDN).
pub fn rewrite_variant(bytes: &[u8], opts: RewriteOptions<'_>) -> Result<String, ManifestError> {
    let mut playlist = match parse_playlist_res(bytes) {
        Ok(Playlist::MediaPlaylist(pl)) => pl,
        Ok(Playlist::MasterPlaylist(_)) => return Err(ManifestError::NotMediaPlaylist),
        Err(e) => return Err(ManifestError::Parse(e.to_string())),
    };

    for segment in &mut playlist.segments {
        if let Some(key) = segment.key.as_mut() {
            if key.uri.is_some() {
                key.uri = Some(opts.key_uri.to_string());
                key.iv = Some(format!("0x{}", opts.iv_hex));
            }
        }
        if let Some(map) = segment.map.as_mut() {
            if let Some(uri) = rewrite_uri(&map.uri, opts.segments) {
                map.uri = uri;
            }
        }
        if let Some(uri) = rewrite_uri(&segment.uri, opts.segments) {
            segment.uri = uri;
        }
    }

    let mut out = Vec::new();
    playlist
        .write_to(&mut out)
        .map_err(|e| ManifestError::Parse(e.to_string()))?;
    String::from_utf8(out).map_err(|e| ManifestError::Parse(e.to_string()))
}
