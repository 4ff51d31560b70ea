//! Embedded image metadata: capture time and GPS position.

use crate::error::MetadataError;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use exif::{Exif, In, Reader, Tag, Value};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

const RAW_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";
const DEFAULT_OFFSET: &str = "+00:00";

/// Position in decimal degrees, altitude in metres
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Normalized metadata for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Camera format, e.g. `2022:05:13 18:20:14-04:00`
    pub raw_timestamp: String,
    /// ISO-8601 with offset, e.g. `2022-05-13T18:20:14-04:00`
    pub timestamp_iso: String,
    pub gps: Option<GpsFix>,
}

/// Reads EXIF timestamp and GPS tags
#[derive(Debug, Clone, Default)]
pub struct MetadataExtractor;

impl MetadataExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract timestamp and GPS from the image at `image_path`. Missing GPS is not an error.
    pub fn extract(&self, image_path: &Path) -> Result<ImageMetadata, MetadataError> {
        let unreadable = |details: String| MetadataError::Unreadable {
            path: image_path.to_path_buf(),
            details,
        };

        let file = File::open(image_path).map_err(|e| unreadable(e.to_string()))?;
        let exif = Reader::new()
            .read_from_container(&mut BufReader::new(file))
            .map_err(|e| unreadable(e.to_string()))?;

        let datetime = ascii_field(&exif, Tag::DateTimeOriginal).ok_or_else(|| {
            MetadataError::MissingTimestamp {
                path: image_path.to_path_buf(),
            }
        })?;
        let offset = ascii_field(&exif, Tag::OffsetTimeOriginal)
            .or_else(|| ascii_field(&exif, Tag::OffsetTime))
            .unwrap_or_else(|| DEFAULT_OFFSET.to_string());

        let raw_timestamp = format!("{}{}", datetime.trim(), offset.trim());
        let timestamp_iso = timestamp_iso_from_raw(&raw_timestamp)?;

        let gps = gps_fix(&exif);
        if gps.is_none() {
            warn!(
                "GPS information could not be retrieved from {}",
                image_path.display()
            );
        }

        debug!(
            "Extracted metadata from {}: {} {:?}",
            image_path.display(),
            timestamp_iso,
            gps
        );

        Ok(ImageMetadata {
            raw_timestamp,
            timestamp_iso,
            gps,
        })
    }
}

/// Convert degrees/minutes/seconds to signed decimal degrees
pub fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64, reference: &str) -> f64 {
    let decimal = degrees + minutes / 60.0 + seconds / 3600.0;
    match reference.trim() {
        "S" | "W" => -decimal,
        _ => decimal,
    }
}

/// Turn a raw camera timestamp (`YYYY:MM:DD HH:MM:SS[±HH:MM|Z]`) into ISO-8601.
/// A missing offset is treated as UTC.
pub fn timestamp_iso_from_raw(raw: &str) -> Result<String, MetadataError> {
    let malformed = || MetadataError::MalformedTimestamp {
        value: raw.to_string(),
    };

    let raw = raw.trim();
    let (datetime, offset) = split_offset(raw);
    let naive = NaiveDateTime::parse_from_str(datetime, RAW_DATETIME_FORMAT).map_err(|_| malformed())?;

    let offset = match offset {
        "" | "Z" => DEFAULT_OFFSET,
        other => other,
    };
    let offset: FixedOffset = offset.parse().map_err(|_| malformed())?;

    let local: DateTime<FixedOffset> = naive
        .and_local_timezone(offset)
        .single()
        .ok_or_else(malformed)?;

    Ok(local.to_rfc3339())
}

/// Split a raw timestamp into its date/time part and its trailing zone designator
pub(crate) fn split_offset(raw: &str) -> (&str, &str) {
    // The zone can only start after the time portion ("YYYY:MM:DD HH")
    let search_from = raw.find(' ').map(|i| i + 1).unwrap_or(0);
    match raw[search_from..].find(['+', '-', 'Z']) {
        Some(i) => raw.split_at(search_from + i),
        None => (raw, ""),
    }
}

fn ascii_field(exif: &Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Ascii(parts) => parts
            .first()
            .map(|bytes| String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string())
            .filter(|s| !s.trim().is_empty()),
        _ => None,
    }
}

fn rationals(exif: &Exif, tag: Tag) -> Option<Vec<f64>> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Rational(values) if !values.is_empty() => {
            let converted: Vec<f64> = values.iter().map(|r| r.to_f64()).collect();
            converted.iter().all(|v| v.is_finite()).then_some(converted)
        }
        _ => None,
    }
}

fn coordinate(exif: &Exif, value_tag: Tag, ref_tag: Tag) -> Option<f64> {
    let parts = rationals(exif, value_tag)?;
    if parts.len() != 3 {
        return None;
    }
    let reference = ascii_field(exif, ref_tag).unwrap_or_default();
    Some(dms_to_decimal(parts[0], parts[1], parts[2], &reference))
}

fn gps_fix(exif: &Exif) -> Option<GpsFix> {
    let latitude = coordinate(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef)?;
    let longitude = coordinate(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef)?;

    let below_sea_level = exif
        .get_field(Tag::GPSAltitudeRef, In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        == Some(1);
    let altitude = rationals(exif, Tag::GPSAltitude)
        .and_then(|v| v.first().copied())
        .map(|a| if below_sea_level { -a } else { a })
        .unwrap_or(0.0);

    Some(GpsFix {
        latitude,
        longitude,
        altitude,
    })
}
