//! Matching on-disk recording sets to the running pipeline.
//!
//! A recording directory holds files named `<deviceId>-<nodeName>.<ext>`, one
//! video container and one metadata log (`.meta`) per recorded node. Given the
//! devices currently visible and the node names the pipeline expects, exactly
//! one device must have recorded exactly that set of nodes. Picking one of
//! several equally valid devices is never done silently.

use crate::error::ReplayError;

/// Files ending in this suffix are metadata logs, not streams
pub const METADATA_SUFFIX: &str = "meta";

/// Node names recorded for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecordingSet {
    pub device_id: String,
    pub node_names: Vec<String>,
}

impl DeviceRecordingSet {
    /// Collect the stream files of `device_id` from a directory listing
    pub fn collect<S: AsRef<str>>(device_id: &str, filenames: &[S]) -> Self {
        let mut node_names: Vec<String> = filenames
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| !name.ends_with(METADATA_SUFFIX))
            .filter_map(|name| node_name(name, device_id))
            .map(str::to_string)
            .collect();
        node_names.sort();

        Self {
            device_id: device_id.to_string(),
            node_names,
        }
    }

    /// Same node names, same count, nothing missing and nothing extra
    pub fn matches<S: AsRef<str>>(&self, expected: &[S]) -> bool {
        if self.node_names.len() != expected.len() {
            return false;
        }
        let mut expected: Vec<&str> = expected.iter().map(AsRef::as_ref).collect();
        expected.sort_unstable();
        self.node_names.iter().map(String::as_str).eq(expected)
    }
}

/// Node name embedded in `filename` after `device_id` and one separator.
fn node_name<'a>(filename: &'a str, device_id: &str) -> Option<&'a str> {
    if device_id.is_empty() {
        return None;
    }
    let pos = filename.find(device_id)?;
    let rest = &filename[pos + device_id.len()..];
    let mut chars = rest.chars();
    chars.next()?;
    let rest = chars.as_str();
    let end = rest.rfind('.').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Find the single device whose recordings match `node_names`.
///
/// Returns `Ok(None)` when no device matches and an error when more than one
/// does.
pub fn match_recording_set<D, F, N>(
    device_ids: &[D],
    filenames: &[F],
    node_names: &[N],
) -> Result<Option<String>, ReplayError>
where
    D: AsRef<str>,
    F: AsRef<str>,
    N: AsRef<str>,
{
    let matching: Vec<String> = device_ids
        .iter()
        .map(|id| DeviceRecordingSet::collect(id.as_ref(), filenames))
        .filter(|set| set.matches(node_names))
        .map(|set| set.device_id)
        .collect();

    match matching.len() {
        0 => {
            log::debug!("No recording set matches nodes {:?}", as_strs(node_names));
            Ok(None)
        }
        1 => Ok(matching.into_iter().next()),
        _ => Err(ReplayError::AmbiguousRecording(matching)),
    }
}

fn as_strs<S: AsRef<str>>(items: &[S]) -> Vec<&str> {
    items.iter().map(AsRef::as_ref).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_device_matches() {
        let result = match_recording_set(
            &["1844301"],
            &["1844301-cam.mp4", "1844301-cam.meta"],
            &["cam"],
        )
        .unwrap();
        assert_eq!(result.as_deref(), Some("1844301"));
    }

    #[test]
    fn test_ambiguous_devices_fail() {
        let err = match_recording_set(
            &["1844301", "1944302"],
            &[
                "1844301-cam.mp4",
                "1844301-cam.meta",
                "1944302-cam.mp4",
                "1944302-cam.meta",
            ],
            &["cam"],
        )
        .unwrap_err();
        assert_eq!(
            err,
            ReplayError::AmbiguousRecording(vec!["1844301".to_string(), "1944302".to_string()])
        );
    }

    #[test]
    fn test_missing_or_extra_nodes_do_not_match() {
        let files = ["dev1-left.mp4", "dev1-right.mp4", "dev1-left.meta", "dev1-right.meta"];
        assert_eq!(match_recording_set(&["dev1"], &files, &["left"]).unwrap(), None);
        assert_eq!(
            match_recording_set(&["dev1"], &files, &["left", "right", "rgb"]).unwrap(),
            None
        );
        assert_eq!(
            match_recording_set(&["dev1"], &files, &["right", "left"]).unwrap(),
            Some("dev1".to_string())
        );
    }

    #[test]
    fn test_duplicate_node_names_count() {
        let files = ["dev1-cam.mp4", "dev1-cam.h264"];
        assert_eq!(match_recording_set(&["dev1"], &files, &["cam"]).unwrap(), None);
        assert_eq!(
            match_recording_set(&["dev1"], &files, &["cam", "cam"]).unwrap(),
            Some("dev1".to_string())
        );
    }

    #[test]
    fn test_only_one_of_two_devices_matches() {
        let files = ["a1-cam.mp4", "b2-cam.mp4", "b2-imu.mp4"];
        assert_eq!(
            match_recording_set(&["a1", "b2"], &files, &["cam", "imu"]).unwrap(),
            Some("b2".to_string())
        );
    }

    #[test]
    fn test_unknown_device_yields_none() {
        assert_eq!(
            match_recording_set(&["zzz"], &["1844301-cam.mp4"], &["cam"]).unwrap(),
            None
        );
        let empty: [&str; 0] = [];
        assert_eq!(match_recording_set(&empty, &["x-cam.mp4"], &["cam"]).unwrap(), None);
    }

    #[test]
    fn test_collect_strips_id_and_extension() {
        let set = DeviceRecordingSet::collect("19443010", &["19443010-rgb.mp4", "other.txt"]);
        assert_eq!(set.node_names, vec!["rgb".to_string()]);
        let set = DeviceRecordingSet::collect("x", &["x-noext"]);
        assert_eq!(set.node_names, vec!["noext".to_string()]);
    }
}
