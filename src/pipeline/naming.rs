use crate::error::TriggerError;
use crate::metadata::split_offset;
use crate::workspace::is_plain_file_name;

const DEFAULT_EXTENSION: &str = "JPG";

/// Location ids end up in file names, so they may not carry path syntax
pub fn check_location_id(location_id: &str) -> Result<(), TriggerError> {
    let invalid = |details: &str| -> Result<(), TriggerError> {
        Err(TriggerError::InvalidLocation {
            details: details.to_string(),
        })
    };

    if location_id.trim().is_empty() {
        return invalid("location id is empty");
    }
    if location_id.chars().any(char::is_control) {
        return invalid("location id contains control characters");
    }
    if location_id.contains(['/', '\\']) || location_id.contains("..") {
        return invalid("location id contains path separators or '..'");
    }
    Ok(())
}

/// `2022:05:13 18:20:14-04:00` → `20220513_182014-04:00`. The zone designator is kept as is.
pub fn normalize_timestamp(raw: &str) -> String {
    let (datetime, offset) = split_offset(raw.trim());
    let datetime = datetime.trim();

    let joined = match datetime.split_once(' ') {
        Some((date, time)) => format!("{}_{}", date.replace(':', ""), time.trim().replace(':', "")),
        None => datetime.replace(':', ""),
    };
    format!("{}{}", joined, offset)
}

/// Blob name for a cycle: `{location}_{normalized timestamp}.{ext}`. Fails when
/// the pieces would not form a single file name.
pub fn derive_filename(
    location_id: &str,
    raw_timestamp: &str,
    extension: Option<&str>,
) -> Result<String, TriggerError> {
    check_location_id(location_id)?;
    let extension = extension
        .map(|e| e.trim_start_matches('.'))
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_EXTENSION);
    let name = format!(
        "{}_{}.{}",
        location_id.trim(),
        normalize_timestamp(raw_timestamp),
        extension
    );

    if !is_plain_file_name(&name) {
        return Err(TriggerError::InvalidLocation {
            details: format!("'{}' is not a plain file name", name),
        });
    }
    Ok(name)
}
