//! The file-based service discovery file read by the metrics collector.
//!
//! The file is a JSON array of target groups. The bridge writes a single group labelled
//! `job: aliases` whose targets are `alias:key` strings, followed by `:hostname:service` when
//! either is set. Writes go to a temporary file that is then renamed over the target, so a
//! collector polling the file never sees a partial write.

use std::{
    collections::BTreeMap,
    fmt,
    io,
    path::{Path, PathBuf},
    str::FromStr,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::warn;

use crate::key::{KeyParsingError, PeerKey};

/// Errors when reading or writing the target file.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum TargetsError {
    #[snafu(display("Failed to read {}", path.display()))]
    Read { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to write {}", path.display()))]
    Write { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to rename {} into place", path.display()))]
    Rename { path: PathBuf, source: io::Error },
    #[snafu(display("Failed to create directory {}", path.display()))]
    CreateDir { path: PathBuf, source: io::Error },
    #[snafu(display("Invalid target file"))]
    Parse { source: serde_json::Error },
    #[snafu(display("Failed to serialize targets"))]
    Serialize { source: serde_json::Error },
    #[snafu(display("Target {target:?} has no key"))]
    MissingKey { target: String },
    #[snafu(display("Target {target:?} has an invalid key"))]
    InvalidKey {
        target: String,
        source: KeyParsingError,
    },
}

impl TargetsError {
    /// Whether the file did not exist, the expected case on first start.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Read { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// One scrape target as persisted in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    /// The alias, used as the scrape path segment.
    pub alias: String,
    /// The scraped peer.
    pub target: PeerKey,
    /// Descriptive host name, may be empty.
    pub hostname: String,
    /// Descriptive service name, may be empty.
    pub service: String,
}

impl fmt::Display for TargetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.alias, self.target)?;
        if !self.hostname.is_empty() || !self.service.is_empty() {
            write!(f, ":{}:{}", self.hostname, self.service)?;
        }
        Ok(())
    }
}

impl FromStr for TargetEntry {
    type Err = TargetsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, ':');
        let alias = parts.next().unwrap_or_default();
        let key = parts
            .next()
            .filter(|_| !alias.is_empty())
            .context(MissingKeySnafu { target: s })?;
        let target = key.parse().context(InvalidKeySnafu { target: s })?;
        Ok(Self {
            alias: alias.to_string(),
            target,
            hostname: parts.next().unwrap_or_default().to_string(),
            service: parts.next().unwrap_or_default().to_string(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TargetGroup {
    #[serde(default)]
    labels: BTreeMap<String, String>,
    targets: Vec<String>,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Atomically replaces the file at `path` with `entries`.
pub async fn write_targets(path: &Path, entries: &[TargetEntry]) -> Result<(), TargetsError> {
    let group = TargetGroup {
        labels: BTreeMap::from([("job".to_string(), "aliases".to_string())]),
        targets: entries.iter().map(ToString::to_string).collect(),
    };
    let content = serde_json::to_string_pretty(&[group]).context(SerializeSnafu)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .context(CreateDirSnafu { path: parent })?;
    }
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, content)
        .await
        .context(WriteSnafu { path: &tmp })?;
    tokio::fs::rename(&tmp, path)
        .await
        .context(RenameSnafu { path })?;
    Ok(())
}

/// Reads the targets of all groups in the file at `path`.
///
/// Targets that cannot be parsed are skipped with a warning.
pub async fn read_targets(path: &Path) -> Result<Vec<TargetEntry>, TargetsError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .context(ReadSnafu { path })?;
    let groups: Vec<TargetGroup> = serde_json::from_str(&content).context(ParseSnafu)?;
    let entries = groups
        .iter()
        .flat_map(|group| &group.targets)
        .filter_map(|target| match target.parse() {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("skipping target: {err:#}");
                None
            }
        })
        .collect();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use n0_snafu::{Result, ResultExt};
    use pretty_assertions::assert_eq;

    use super::*;

    fn entry(alias: &str, n: u8, hostname: &str, service: &str) -> TargetEntry {
        TargetEntry {
            alias: alias.to_string(),
            target: PeerKey::from_bytes([n; 32]),
            hostname: hostname.to_string(),
            service: service.to_string(),
        }
    }

    #[test]
    fn target_strings() -> Result {
        let plain = entry("dummy", 1, "", "");
        assert_eq!(plain.to_string(), format!("dummy:{}", plain.target));
        assert_eq!(plain.to_string().parse::<TargetEntry>()?, plain);

        let full = entry("web", 2, "host-1", "api");
        assert_eq!(full.to_string(), format!("web:{}:host-1:api", full.target));
        assert_eq!(full.to_string().parse::<TargetEntry>()?, full);

        assert!(matches!(
            "dummy".parse::<TargetEntry>(),
            Err(TargetsError::MissingKey { .. })
        ));
        assert!(matches!(
            ":abc".parse::<TargetEntry>(),
            Err(TargetsError::MissingKey { .. })
        ));
        assert!(matches!(
            "dummy:notakey".parse::<TargetEntry>(),
            Err(TargetsError::InvalidKey { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn write_then_read() -> Result {
        let dir = tempfile::tempdir().e()?;
        let path = dir.path().join("prometheus").join("targets.json");
        let entries = vec![entry("a", 1, "", ""), entry("b", 2, "host", "svc")];
        write_targets(&path, &entries).await?;
        assert!(!tmp_path(&path).exists());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).e()?).e()?;
        assert_eq!(json[0]["labels"]["job"], "aliases");
        assert_eq!(json[0]["targets"].as_array().map(Vec::len), Some(2));

        assert_eq!(read_targets(&path).await?, entries);

        write_targets(&path, &entries[1..]).await?;
        assert_eq!(read_targets(&path).await?, entries[1..]);
        Ok(())
    }

    #[tokio::test]
    async fn read_failures() -> Result {
        let dir = tempfile::tempdir().e()?;
        let path = dir.path().join("targets.json");
        let err = read_targets(&path).await.unwrap_err();
        assert!(err.is_not_found());

        std::fs::write(&path, "not json").e()?;
        let err = read_targets(&path).await.unwrap_err();
        assert!(matches!(err, TargetsError::Parse { .. }));
        assert!(!err.is_not_found());

        let good = entry("good", 3, "", "");
        std::fs::write(
            &path,
            format!(r#"[{{"labels":{{}},"targets":["bad:key","{good}",""]}}]"#),
        )
        .e()?;
        assert_eq!(read_targets(&path).await?, vec![good]);
        Ok(())
    }
}
