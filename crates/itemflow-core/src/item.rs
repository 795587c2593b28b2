use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::warn;

use crate::config::ItemflowConfig;

pub const KEY_ID: &str = "id";
pub const KEY_TITLE: &str = "title";
pub const KEY_STATUS: &str = "status";
pub const KEY_KIND: &str = "kind";
pub const KEY_CREATED: &str = "created";
pub const KEY_UPDATED: &str = "updated";
pub const KEY_MERGED_AT: &str = "merged_at";
pub const KEY_MERGE_COMMIT_SHA: &str = "merge_commit_sha";
pub const KEY_PR_NUMBER: &str = "pr_number";
pub const KEY_MERGE_STRATEGY: &str = "merge_strategy";

const KNOWN_KEYS: [&str; 10] = [
    KEY_ID,
    KEY_TITLE,
    KEY_STATUS,
    KEY_KIND,
    KEY_CREATED,
    KEY_UPDATED,
    KEY_MERGED_AT,
    KEY_MERGE_COMMIT_SHA,
    KEY_PR_NUMBER,
    KEY_MERGE_STRATEGY,
];

const SLUG_MAX_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("Missing front matter delimiter")]
    MissingFrontMatter,
    #[error("Missing closing --- for front matter")]
    MissingFrontMatterEnd,
    #[error("Invalid front matter: {0}")]
    InvalidFrontMatter(String),
    #[error("invalid work item id {0:?}: expected a number such as 14 or 014")]
    InvalidId(String),
    #[error("work item {id} not found under {root}")]
    NotFound { id: String, root: PathBuf },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<ItemError>,
    },
}

impl ItemError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ItemError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeRecord {
    pub merged_at: String,
    pub merge_commit_sha: String,
    pub pr_number: u64,
    pub merge_strategy: String,
}

impl MergeRecord {
    pub fn fields(&self) -> Vec<(String, Value)> {
        vec![
            (KEY_MERGED_AT.to_string(), Value::String(self.merged_at.clone())),
            (
                KEY_MERGE_COMMIT_SHA.to_string(),
                Value::String(self.merge_commit_sha.clone()),
            ),
            (KEY_PR_NUMBER.to_string(), Value::Number(self.pr_number.into())),
            (
                KEY_MERGE_STRATEGY.to_string(),
                Value::String(self.merge_strategy.clone()),
            ),
        ]
    }
}

/// Front matter plus body, kept losslessly. Keys keep their file order; the
/// body is never reformatted.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDocument {
    pub front: Mapping,
    pub body: String,
}

impl ItemDocument {
    pub fn parse(text: &str) -> Result<Self, ItemError> {
        let (front, body) = split_front_matter(text)?;
        let front = if front.trim().is_empty() {
            Mapping::new()
        } else {
            match serde_yaml::from_str::<Value>(front) {
                Ok(Value::Mapping(map)) => map,
                Ok(Value::Null) => Mapping::new(),
                Ok(_) => {
                    return Err(ItemError::InvalidFrontMatter(
                        "front matter is not a key/value mapping".to_string(),
                    ))
                }
                Err(err) => return Err(ItemError::InvalidFrontMatter(err.to_string())),
            }
        };
        Ok(Self {
            front,
            body: body.to_string(),
        })
    }

    pub fn render(&self) -> Result<String, ItemError> {
        let mut out = String::from("---\n");
        if !self.front.is_empty() {
            let yaml = serde_yaml::to_string(&self.front)
                .map_err(|err| ItemError::InvalidFrontMatter(err.to_string()))?;
            out.push_str(&yaml);
            if !yaml.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str("---\n");
        out.push_str(&self.body);
        Ok(out)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.front.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(value_to_string)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// Existing keys are updated in place; new keys are appended.
    pub fn set(&mut self, key: &str, value: Value) {
        self.front.insert(Value::String(key.to_string()), value);
    }

    pub fn touch(&mut self) {
        self.set(KEY_UPDATED, Value::String(now_rfc3339()));
    }
}

/// Splits `---` delimited front matter from the body. The body is returned
/// verbatim, starting right after the closing delimiter line.
pub fn split_front_matter(text: &str) -> Result<(&str, &str), ItemError> {
    let first_end = match text.find('\n') {
        Some(idx) => idx,
        None => return Err(ItemError::MissingFrontMatter),
    };
    if text[..first_end].trim_end_matches('\r') != "---" {
        return Err(ItemError::MissingFrontMatter);
    }
    let front_start = first_end + 1;
    let mut cursor = front_start;
    while cursor <= text.len() {
        let line_end = text[cursor..]
            .find('\n')
            .map(|idx| cursor + idx)
            .unwrap_or(text.len());
        if text[cursor..line_end].trim_end_matches('\r').trim_end() == "---" {
            let body_start = (line_end + 1).min(text.len());
            return Ok((&text[front_start..cursor], &text[body_start..]));
        }
        if line_end == text.len() {
            break;
        }
        cursor = line_end + 1;
    }
    Err(ItemError::MissingFrontMatterEnd)
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    /// Status of the folder that currently holds the file.
    pub status: String,
    pub kind: Option<String>,
    pub created: Option<String>,
    pub updated: Option<String>,
    pub merge: Option<MergeRecord>,
    /// Every front matter key not listed above, in file order.
    pub extra: Mapping,
    pub file_path: PathBuf,
    pub body: String,
}

impl WorkItem {
    pub fn from_document(
        doc: &ItemDocument,
        path: &Path,
        status: &str,
        id_width: usize,
    ) -> Self {
        let id = doc
            .get(KEY_ID)
            .and_then(|value| normalize_value_id(value, id_width))
            .or_else(|| id_from_filename(path, id_width))
            .unwrap_or_default();
        let mut extra = Mapping::new();
        for (key, value) in &doc.front {
            let known = key
                .as_str()
                .map(|key| KNOWN_KEYS.contains(&key))
                .unwrap_or(false);
            if !known {
                extra.insert(key.clone(), value.clone());
            }
        }
        Self {
            id,
            title: doc.get_string(KEY_TITLE).unwrap_or_default(),
            status: status.to_string(),
            kind: doc.get_string(KEY_KIND),
            created: doc.get_string(KEY_CREATED),
            updated: doc.get_string(KEY_UPDATED),
            merge: merge_record(doc),
            extra,
            file_path: path.to_path_buf(),
            body: doc.body.clone(),
        }
    }

    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn slug(&self) -> String {
        slugify(&self.title)
    }

    pub fn branch_name(&self) -> String {
        branch_name(&self.id, &self.title)
    }

    pub fn is_merged(&self) -> bool {
        self.merge.is_some()
    }
}

fn merge_record(doc: &ItemDocument) -> Option<MergeRecord> {
    let merged_at = doc.get_string(KEY_MERGED_AT)?;
    Some(MergeRecord {
        merged_at,
        merge_commit_sha: doc.get_string(KEY_MERGE_COMMIT_SHA).unwrap_or_default(),
        pr_number: doc
            .get(KEY_PR_NUMBER)
            .and_then(value_to_string)
            .and_then(|value| value.trim().trim_start_matches('#').parse().ok())
            .unwrap_or(0),
        merge_strategy: doc.get_string(KEY_MERGE_STRATEGY).unwrap_or_default(),
    })
}

pub fn normalize_item_id(raw: &str, width: usize) -> Result<String, ItemError> {
    let trimmed = raw.trim().trim_start_matches('#');
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(ItemError::InvalidId(raw.to_string()));
    }
    let number: u64 = trimmed
        .parse()
        .map_err(|_| ItemError::InvalidId(raw.to_string()))?;
    Ok(format!("{:0width$}", number, width = width))
}

fn normalize_value_id(value: &Value, width: usize) -> Option<String> {
    let raw = value_to_string(value)?;
    normalize_item_id(&raw, width).ok()
}

fn id_from_filename(path: &Path, width: usize) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let re = Regex::new(r"^(\d+)").ok()?;
    let digits = re.captures(stem)?.get(1)?.as_str().to_string();
    normalize_item_id(&digits, width).ok()
}

pub fn slugify(title: &str) -> String {
    let lowered = title.trim().to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    let mut pending_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    if slug.len() > SLUG_MAX_LEN {
        slug.truncate(SLUG_MAX_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

pub fn branch_name(id: &str, title: &str) -> String {
    format!("{}-{}", id, slugify(title))
}

pub fn items_root(repo_root: &Path, config: &ItemflowConfig) -> PathBuf {
    repo_root.join(config.root_dir())
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_item_file(path: &Path, status: &str, id_width: usize) -> Result<WorkItem, ItemError> {
    let text = fs::read_to_string(path).map_err(|err| ItemError::io(path, err))?;
    let doc = ItemDocument::parse(&text).map_err(|err| ItemError::Parse {
        path: path.to_path_buf(),
        source: Box::new(err),
    })?;
    Ok(WorkItem::from_document(&doc, path, status, id_width))
}

/// Every file for `id` across the configured status folders, in status order.
/// More than one hit means a stale copy was left behind by an earlier move.
pub fn locate_work_items(
    items_root: &Path,
    config: &ItemflowConfig,
    id: &str,
) -> Result<Vec<WorkItem>, ItemError> {
    let width = config.id_width();
    let prefix = format!("{id}-");
    let exact = format!("{id}.md");
    let mut found = Vec::new();
    for (status, folder) in config.statuses() {
        let dir = items_root.join(&folder);
        let mut entries: Vec<PathBuf> = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().map(|ext| ext == "md").unwrap_or(false))
                .collect(),
            Err(_) => continue,
        };
        entries.sort();
        for path in entries {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            if name.starts_with(&prefix) || name == exact {
                found.push(parse_item_file(&path, &status, width)?);
                continue;
            }
            // Files not following the naming scheme are matched on their id key.
            if let Ok(item) = parse_item_file(&path, &status, width) {
                if item.id == id {
                    found.push(item);
                }
            }
        }
    }
    Ok(found)
}

pub fn find_work_item(
    items_root: &Path,
    config: &ItemflowConfig,
    raw_id: &str,
) -> Result<WorkItem, ItemError> {
    let id = normalize_item_id(raw_id, config.id_width())?;
    let mut found = locate_work_items(items_root, config, &id)?;
    if found.is_empty() {
        return Err(ItemError::NotFound {
            id,
            root: items_root.to_path_buf(),
        });
    }
    // Copies come back in lifecycle order. A completed copy wins, then the
    // most advanced status.
    let chosen = found
        .iter()
        .rposition(WorkItem::is_merged)
        .unwrap_or(found.len() - 1);
    if found.len() > 1 {
        warn!(
            id = %id,
            copies = found.len(),
            "work item exists in more than one status folder; using {}",
            found[chosen].file_path.display()
        );
    }
    Ok(found.swap_remove(chosen))
}

/// Writes next to the target and renames over it, so readers never observe a
/// partially written file.
pub fn write_atomically(path: &Path, content: &str) -> Result<(), ItemError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "item.md".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, content).map_err(|err| ItemError::io(&tmp, err))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(ItemError::io(path, err));
    }
    Ok(())
}

/// Sets the given front matter keys and refreshes `updated`, leaving every
/// other key and the body untouched.
pub fn update_item_fields(path: &Path, fields: &[(String, Value)]) -> Result<(), ItemError> {
    let text = fs::read_to_string(path).map_err(|err| ItemError::io(path, err))?;
    let mut doc = ItemDocument::parse(&text).map_err(|err| ItemError::Parse {
        path: path.to_path_buf(),
        source: Box::new(err),
    })?;
    for (key, value) in fields {
        doc.set(key, value.clone());
    }
    doc.touch();
    write_atomically(path, &doc.render()?)
}

pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(val) => Some(val.clone()),
        Value::Number(num) => Some(num.to_string()),
        Value::Bool(val) => Some(val.to_string()),
        Value::Null => None,
        _ => serde_yaml::to_string(value).ok().map(|s| s.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const SAMPLE: &str = "---\n\
id: '014'\n\
title: Add login page\n\
status: todo\n\
kind: feature\n\
labels:\n- auth\n- ui\n\
owner:\n  name: sam\n  team: web\n\
created: 2024-05-01T10:00:00Z\n\
---\n\
\n\
## Description\n\
Body text stays  exactly   as written.\n";

    #[test]
    fn split_front_matter_keeps_body_verbatim() {
        let (front, body) = split_front_matter(SAMPLE).expect("split");
        assert!(front.starts_with("id: '014'"));
        assert_eq!(body, "\n## Description\nBody text stays  exactly   as written.\n");
    }

    #[test]
    fn split_front_matter_errors_when_missing() {
        assert!(matches!(
            split_front_matter("no front matter\n"),
            Err(ItemError::MissingFrontMatter)
        ));
        assert!(matches!(
            split_front_matter("---\nid: 1\n"),
            Err(ItemError::MissingFrontMatterEnd)
        ));
    }

    #[test]
    fn work_item_separates_known_and_extra_fields() {
        let doc = ItemDocument::parse(SAMPLE).expect("parse");
        let item = WorkItem::from_document(&doc, Path::new("/w/todo/014-add-login-page.md"), "todo", 3);
        assert_eq!(item.id, "014");
        assert_eq!(item.title, "Add login page");
        assert_eq!(item.kind.as_deref(), Some("feature"));
        let extra_keys: Vec<&str> = item.extra.keys().filter_map(Value::as_str).collect();
        assert_eq!(extra_keys, vec!["labels", "owner"]);
        assert!(item.merge.is_none());
    }

    #[test]
    fn numeric_ids_are_zero_padded() {
        let doc = ItemDocument::parse("---\nid: 14\ntitle: x\n---\n").expect("parse");
        let item = WorkItem::from_document(&doc, Path::new("x.md"), "todo", 3);
        assert_eq!(item.id, "014");
        assert_eq!(normalize_item_id("7", 3).expect("id"), "007");
        assert_eq!(normalize_item_id("#1234", 3).expect("id"), "1234");
        assert!(matches!(normalize_item_id("abc", 3), Err(ItemError::InvalidId(_))));
        assert!(matches!(normalize_item_id("", 3), Err(ItemError::InvalidId(_))));
    }

    #[test]
    fn id_falls_back_to_filename() {
        let doc = ItemDocument::parse("---\ntitle: x\n---\n").expect("parse");
        let item = WorkItem::from_document(&doc, Path::new("/w/todo/9-x.md"), "todo", 3);
        assert_eq!(item.id, "009");
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Add login page!"), "add-login-page");
        assert_eq!(slugify("  Fix: crash -- on  start "), "fix-crash-on-start");
        assert_eq!(slugify("???"), "untitled");
        assert_eq!(branch_name("014", "Add login page"), "014-add-login-page");
        let long = slugify(&"word ".repeat(30));
        assert!(long.len() <= 50);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn update_preserves_other_fields_order_and_body() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("014-add-login-page.md");
        fs::write(&path, SAMPLE).expect("write");

        update_item_fields(&path, &[("status".to_string(), Value::String("doing".into()))])
            .expect("update");

        let text = fs::read_to_string(&path).expect("read");
        let doc = ItemDocument::parse(&text).expect("parse");
        let keys: Vec<&str> = doc.front.keys().filter_map(Value::as_str).collect();
        assert_eq!(
            keys,
            vec!["id", "title", "status", "kind", "labels", "owner", "created", "updated"]
        );
        assert_eq!(doc.get_string("status").as_deref(), Some("doing"));
        assert_eq!(doc.body, "\n## Description\nBody text stays  exactly   as written.\n");
        assert!(!temp.path().join(".014-add-login-page.md.tmp").exists());
    }

    #[test]
    fn locate_work_items_scans_status_folders() {
        let temp = TempDir::new().expect("tempdir");
        let config = ItemflowConfig::default();
        let root = temp.path().join("work");
        fs::create_dir_all(root.join("todo")).expect("todo");
        fs::create_dir_all(root.join("doing")).expect("doing");
        fs::write(root.join("todo").join("014-a.md"), "---\nid: '014'\ntitle: A\n---\n").expect("write");
        fs::write(root.join("doing").join("015-b.md"), "---\nid: '015'\ntitle: B\n---\n").expect("write");

        let item = find_work_item(&root, &config, "14").expect("find");
        assert_eq!(item.status, "todo");
        assert_eq!(item.title, "A");

        let item = find_work_item(&root, &config, "015").expect("find");
        assert_eq!(item.status, "doing");

        assert!(matches!(
            find_work_item(&root, &config, "016"),
            Err(ItemError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_copies_resolve_to_the_most_advanced_status() {
        let temp = TempDir::new().expect("tempdir");
        let config = ItemflowConfig::default();
        let root = temp.path().join("work");
        for folder in ["todo", "doing", "backlog"] {
            fs::create_dir_all(root.join(folder)).expect("folder");
            fs::write(
                root.join(folder).join("014-a.md"),
                format!("---\nid: '014'\ntitle: A\nstatus: {folder}\n---\n"),
            )
            .expect("write");
        }
        assert_eq!(find_work_item(&root, &config, "14").expect("find").status, "doing");

        fs::write(
            root.join("backlog").join("014-a.md"),
            "---\nid: '014'\ntitle: A\nmerged_at: '2026-01-01T00:00:00Z'\npr_number: 3\n---\n",
        )
        .expect("merged copy");
        let item = find_work_item(&root, &config, "14").expect("find");
        assert_eq!(item.status, "backlog");
        assert!(item.is_merged());
    }

    #[test]
    fn rewrite_keeps_array_and_nested_values() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("014-a.md");
        let original = "---\nid: '014'\ntitle: A\nstatus: todo\ntags: [a, b]\nreviewers:\n  - ann\n  - bob\nestimate:\n  points: 3\n  confidence: low\n---\nBody\n";
        fs::write(&path, original).expect("write");
        let before = ItemDocument::parse(original).expect("parse");

        update_item_fields(&path, &[("status".to_string(), Value::String("doing".into()))])
            .expect("update");
        let after = ItemDocument::parse(&fs::read_to_string(&path).expect("read")).expect("reparse");

        for key in ["id", "title", "tags", "reviewers", "estimate"] {
            assert_eq!(after.get(key), before.get(key), "field {key}");
        }
        let tags: Vec<&str> = after
            .get("tags")
            .and_then(Value::as_sequence)
            .expect("tags")
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert_eq!(after.get_string("status").as_deref(), Some("doing"));
        assert_eq!(after.body, "Body\n");
    }
}
