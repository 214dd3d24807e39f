use chrono::Utc;
use retort_core::{atomic_write_json_pretty, canonical_json_digest, ensure_dir};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

pub const STORE_META_DIR: &str = ".retort";
pub const CONFIG_FILE_NAME: &str = "retort.yaml";
pub const RUN_REPORT_SCHEMA: &str = "run_report_v1";
pub const STAMP_SCHEMA: &str = "stage_stamp_v1";
const FINGERPRINT_SCHEMA: &str = "stage_fingerprint_v1";

pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("stage '{stage}' is missing input store '{store}' at {}", .path.display())]
    MissingInput {
        stage: String,
        store: String,
        path: PathBuf,
    },
    #[error("stage '{stage}' failed ({status}); command: {command}")]
    StageExecution {
        stage: String,
        status: String,
        command: String,
    },
    #[error("partial write publishing store at {}: {message}", .path.display())]
    PartialWrite { path: PathBuf, message: String },
    #[error("io failure at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn io_error(path: &Path, source: std::io::Error) -> OrchestrationError {
    OrchestrationError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionKey {
    tokens: [String; 4],
}

impl VersionKey {
    pub fn new(e: &str, s: &str, c: &str, t: &str) -> Result<Self> {
        let tokens = [
            e.to_string(),
            s.to_string(),
            c.to_string(),
            t.to_string(),
        ];
        for token in &tokens {
            validate_token(token)?;
        }
        Ok(Self { tokens })
    }

    /// Parses the `E-S-C-T` form. Tokens cannot contain `-`, so the split is
    /// unambiguous.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('-').collect();
        if parts.len() != 4 {
            return Err(OrchestrationError::Configuration(format!(
                "version '{}' must have exactly four dash-separated tokens (E-S-C-T)",
                raw
            )));
        }
        Self::new(parts[0], parts[1], parts[2], parts[3])
    }

    pub fn e(&self) -> &str {
        &self.tokens[0]
    }

    pub fn s(&self) -> &str {
        &self.tokens[1]
    }

    pub fn c(&self) -> &str {
        &self.tokens[2]
    }

    pub fn t(&self) -> &str {
        &self.tokens[3]
    }

    pub fn prefix(&self, depth: usize) -> String {
        self.tokens[..depth.min(4)].join("-")
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix(4))
    }
}

fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(OrchestrationError::Configuration(
            "version tokens must be non-empty".to_string(),
        ));
    }
    let ok = token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !ok {
        return Err(OrchestrationError::Configuration(format!(
            "version token '{}' contains characters outside [A-Za-z0-9_.]",
            token
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Origin,
    Meta,
    Support,
    Substrate0,
    Library,
    Cache,
    Substrate,
    Coagulate,
    Target,
}

pub const ALL_ROLES: [Role; 9] = [
    Role::Origin,
    Role::Meta,
    Role::Support,
    Role::Substrate0,
    Role::Library,
    Role::Cache,
    Role::Substrate,
    Role::Coagulate,
    Role::Target,
];

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Origin => "origin",
            Role::Meta => "meta",
            Role::Support => "support",
            Role::Substrate0 => "substrate0",
            Role::Library => "library",
            Role::Cache => "cache",
            Role::Substrate => "substrate",
            Role::Coagulate => "coagulate",
            Role::Target => "target",
        }
    }

    /// Number of version tokens folded into the directory name. External
    /// inputs are unversioned.
    pub fn depth(&self) -> usize {
        match self {
            Role::Origin | Role::Meta | Role::Support | Role::Substrate0 | Role::Library => 0,
            Role::Cache => 1,
            Role::Substrate => 2,
            Role::Coagulate => 3,
            Role::Target => 4,
        }
    }

    pub fn is_external(&self) -> bool {
        self.depth() == 0
    }

    /// Flag used to hand this store to a stage process. `substrate0` is
    /// consumed only by the built-in side-load step and has no flag.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            Role::Origin => Some("--origin"),
            Role::Meta => Some("--meta"),
            Role::Support => Some("--support"),
            Role::Substrate0 => None,
            Role::Library => Some("--library"),
            Role::Cache => Some("--cache"),
            Role::Substrate => Some("--substrate"),
            Role::Coagulate => Some("--coagulate"),
            Role::Target => Some("--target"),
        }
    }

    pub fn dir_name(&self, key: &VersionKey) -> String {
        if self.is_external() {
            self.as_str().to_string()
        } else {
            format!("{}-{}", self.as_str(), key.prefix(self.depth()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedStore {
    pub role: Role,
    pub dir_name: String,
    pub path: PathBuf,
}

impl ResolvedStore {
    pub fn resolve(root: &Path, role: Role, key: &VersionKey) -> Self {
        let dir_name = role.dir_name(key);
        let path = root.join(&dir_name);
        Self {
            role,
            dir_name,
            path,
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// A store is satisfied when its directory holds at least one entry
    /// besides the orchestrator's own `.retort` metadata. An empty directory
    /// is not a satisfied store.
    pub fn is_satisfied(&self) -> bool {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(_) => return false,
        };
        for entry in entries.flatten() {
            if entry.file_name() != STORE_META_DIR {
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The stage materializes a store that did not exist for this version
    /// prefix; the orchestrator publishes it atomically.
    Creates,
    /// The stage refines, in place, a store created earlier in the chain.
    Amends,
}

#[derive(Debug, Clone)]
pub enum StageKind {
    /// External transformation, invoked as `<command...> <name> --<role> <path>...`.
    Command(String),
    /// Built-in merge of a fixed external directory into the written store,
    /// copying only entries the store does not already have.
    SideLoad { source: Role },
}

impl StageKind {
    pub fn name(&self) -> &str {
        match self {
            StageKind::Command(name) => name,
            StageKind::SideLoad { .. } => "side-load",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageSpec {
    pub slug: String,
    pub kind: StageKind,
    pub reads: Vec<Role>,
    pub writes: Vec<Role>,
    pub write_mode: WriteMode,
    pub params: BTreeMap<String, String>,
}

impl StageSpec {
    fn command_stage(
        slug: &str,
        name: &str,
        reads: &[Role],
        writes: &[Role],
        write_mode: WriteMode,
    ) -> Self {
        Self {
            slug: slug.to_string(),
            kind: StageKind::Command(name.to_string()),
            reads: reads.to_vec(),
            writes: writes.to_vec(),
            write_mode,
            params: BTreeMap::new(),
        }
    }

    fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub stages: Vec<StageSpec>,
}

impl Pipeline {
    /// The standard chain: extract into cache, condense into substrate,
    /// side-load substrate0, refine substrate in place (filter plus a second
    /// condense pass), coagulate, crystalize the target, oxidize it in place,
    /// then feed results back into cache/substrate.
    pub fn standard() -> Self {
        use Role::*;
        let stages = vec![
            StageSpec::command_stage("extract", "extract", &[Origin], &[Cache], WriteMode::Creates),
            StageSpec::command_stage(
                "condense-immediate",
                "condense",
                &[Origin, Meta, Support, Cache],
                &[Substrate],
                WriteMode::Creates,
            )
            .with_param("group", "immediate"),
            StageSpec {
                slug: "sideload-substrate0".to_string(),
                kind: StageKind::SideLoad {
                    source: Substrate0,
                },
                reads: vec![Substrate0, Substrate],
                writes: vec![Substrate],
                write_mode: WriteMode::Amends,
                params: BTreeMap::new(),
            },
            StageSpec::command_stage(
                "filter",
                "filter",
                &[Origin, Meta, Cache, Substrate],
                &[Substrate],
                WriteMode::Amends,
            ),
            StageSpec::command_stage(
                "condense-filtered",
                "condense",
                &[Origin, Meta, Support, Cache, Substrate],
                &[Substrate],
                WriteMode::Amends,
            )
            .with_param("group", "filtered"),
            StageSpec::command_stage(
                "coagulate",
                "coagulate",
                &[Substrate],
                &[Coagulate],
                WriteMode::Creates,
            ),
            StageSpec::command_stage(
                "crystalize",
                "crystalize",
                &[Substrate, Coagulate],
                &[Target],
                WriteMode::Creates,
            ),
            StageSpec::command_stage(
                "oxidize",
                "oxidize",
                &[Support, Library, Target],
                &[Target],
                WriteMode::Amends,
            ),
            StageSpec::command_stage(
                "update",
                "update",
                &[Origin, Meta, Cache, Substrate],
                &[Cache, Substrate],
                WriteMode::Amends,
            ),
        ];
        Self { stages }
    }

    /// Configuration-time validation: every read is external or created by an
    /// earlier stage, amended stores were created earlier and are also read,
    /// no store is created twice, and creating stages respect version
    /// monotonicity (write depth not below the deepest read).
    pub fn validate(&self) -> Result<()> {
        let mut slugs: BTreeSet<&str> = BTreeSet::new();
        let mut created: BTreeSet<Role> = BTreeSet::new();
        for stage in &self.stages {
            if stage.slug.is_empty() {
                return Err(OrchestrationError::Configuration(
                    "stage slug must be non-empty".to_string(),
                ));
            }
            if !slugs.insert(stage.slug.as_str()) {
                return Err(OrchestrationError::Configuration(format!(
                    "duplicate stage slug '{}'",
                    stage.slug
                )));
            }
            if stage.writes.is_empty() {
                return Err(OrchestrationError::Configuration(format!(
                    "stage '{}' declares no written store",
                    stage.slug
                )));
            }
            for role in &stage.reads {
                if !role.is_external() && !created.contains(role) {
                    return Err(OrchestrationError::Configuration(format!(
                        "stage '{}' reads store '{}' that no earlier stage creates",
                        stage.slug,
                        role.as_str()
                    )));
                }
            }
            if let StageKind::SideLoad { source } = &stage.kind {
                if !source.is_external() {
                    return Err(OrchestrationError::Configuration(format!(
                        "stage '{}' side-loads from versioned store '{}'",
                        stage.slug,
                        source.as_str()
                    )));
                }
                if !stage.reads.contains(source) {
                    return Err(OrchestrationError::Configuration(format!(
                        "stage '{}' must declare its side-load source among its reads",
                        stage.slug
                    )));
                }
            }
            if let StageKind::Command(_) = &stage.kind {
                for role in stage.reads.iter().chain(stage.writes.iter()) {
                    if role.flag().is_none() {
                        return Err(OrchestrationError::Configuration(format!(
                            "stage '{}' passes store '{}' to an external command, but that store has no flag",
                            stage.slug,
                            role.as_str()
                        )));
                    }
                }
            }
            let max_read_depth = stage.reads.iter().map(|r| r.depth()).max().unwrap_or(0);
            for role in &stage.writes {
                if role.is_external() {
                    return Err(OrchestrationError::Configuration(format!(
                        "stage '{}' writes external input store '{}'",
                        stage.slug,
                        role.as_str()
                    )));
                }
                match stage.write_mode {
                    WriteMode::Creates => {
                        if created.contains(role) {
                            return Err(OrchestrationError::Configuration(format!(
                                "store '{}' is created twice (second creator: stage '{}')",
                                role.as_str(),
                                stage.slug
                            )));
                        }
                        if role.depth() < max_read_depth {
                            return Err(OrchestrationError::Configuration(format!(
                                "stage '{}' creates store '{}' at version depth {} below its deepest read (depth {})",
                                stage.slug,
                                role.as_str(),
                                role.depth(),
                                max_read_depth
                            )));
                        }
                    }
                    WriteMode::Amends => {
                        if !created.contains(role) {
                            return Err(OrchestrationError::Configuration(format!(
                                "stage '{}' amends store '{}' before any stage creates it",
                                stage.slug,
                                role.as_str()
                            )));
                        }
                        if !stage.reads.contains(role) {
                            return Err(OrchestrationError::Configuration(format!(
                                "stage '{}' amends store '{}' without reading it",
                                stage.slug,
                                role.as_str()
                            )));
                        }
                    }
                }
            }
            if stage.write_mode == WriteMode::Creates {
                for role in &stage.writes {
                    created.insert(*role);
                }
            }
        }
        Ok(())
    }

    pub fn stage_index(&self, slug: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.slug == slug)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub force: bool,
    pub force_from: Option<String>,
    pub stage_cmd: Option<String>,
}

pub fn resolve_stage_command(root: &Path, override_cmd: Option<&str>) -> Result<Vec<String>> {
    if let Some(raw) = override_cmd {
        let parts: Vec<String> = raw.split_whitespace().map(|s| s.to_string()).collect();
        if parts.is_empty() {
            return Err(OrchestrationError::Configuration(
                "--stage-cmd must name a program".to_string(),
            ));
        }
        return Ok(parts);
    }
    let config_path = root.join(CONFIG_FILE_NAME);
    if !config_path.is_file() {
        return Err(OrchestrationError::Configuration(format!(
            "no stage command configured: pass --stage-cmd or create {} with a 'command' list",
            config_path.display()
        )));
    }
    let raw = fs::read_to_string(&config_path).map_err(|e| io_error(&config_path, e))?;
    let yaml: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|e| {
        OrchestrationError::Configuration(format!(
            "{} is not valid YAML: {}",
            config_path.display(),
            e
        ))
    })?;
    let value: Value = serde_json::to_value(&yaml).map_err(|e| {
        OrchestrationError::Configuration(format!(
            "{} could not be interpreted: {}",
            config_path.display(),
            e
        ))
    })?;
    let command = value
        .pointer("/command")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            OrchestrationError::Configuration(format!(
                "{} must define 'command' as a list of strings",
                config_path.display()
            ))
        })?;
    let mut parts = Vec::new();
    for part in command {
        match part.as_str() {
            Some(s) if !s.is_empty() => parts.push(s.to_string()),
            _ => {
                return Err(OrchestrationError::Configuration(format!(
                    "{}: 'command' entries must be non-empty strings",
                    config_path.display()
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(OrchestrationError::Configuration(format!(
            "{}: 'command' must not be empty",
            config_path.display()
        )));
    }
    Ok(parts)
}

#[derive(Debug)]
struct RunLock {
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_run_lock(root: &Path) -> Result<RunLock> {
    let lock_path = root.join(STORE_META_DIR).join("run.lock");
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent).map_err(|e| io_error(parent, e))?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(RunLock { path: lock_path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(OrchestrationError::Configuration(format!(
                "operation_in_progress: another run holds {}",
                lock_path.display()
            )))
        }
        Err(e) => Err(io_error(&lock_path, e)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Cached,
    Running,
    Succeeded,
    Failed,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Cached => "cached",
            StageState::Running => "running",
            StageState::Succeeded => "succeeded",
            StageState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub slug: String,
    pub stage: String,
    pub state: StageState,
    pub note: Option<String>,
    pub elapsed_seconds: f64,
    pub reads: BTreeMap<String, String>,
    pub writes: BTreeMap<String, String>,
}

fn store_map(stores: &[ResolvedStore]) -> BTreeMap<String, String> {
    stores
        .iter()
        .map(|s| (s.role.as_str().to_string(), s.path.display().to_string()))
        .collect()
}

fn record_for(
    stage: &StageSpec,
    state: StageState,
    note: Option<String>,
    elapsed_seconds: f64,
    reads: &[ResolvedStore],
    writes: &[ResolvedStore],
) -> StageRecord {
    StageRecord {
        slug: stage.slug.clone(),
        stage: stage.kind.name().to_string(),
        state,
        note,
        elapsed_seconds,
        reads: store_map(reads),
        writes: store_map(writes),
    }
}

fn stage_record_to_json(record: &StageRecord) -> Value {
    json!({
        "slug": record.slug,
        "stage": record.stage,
        "state": record.state.as_str(),
        "note": record.note,
        "elapsed_seconds": record.elapsed_seconds,
        "reads": record.reads,
        "writes": record.writes,
    })
}

#[allow(clippy::too_many_arguments)]
fn write_run_report(
    run_dir: &Path,
    run_id: &str,
    root: &Path,
    key: &VersionKey,
    command: &[String],
    status: &str,
    started_at: &str,
    finished_at: Option<&str>,
    stages: &[StageRecord],
    error: Option<&str>,
) -> Result<()> {
    let payload = json!({
        "schema_version": RUN_REPORT_SCHEMA,
        "run_id": run_id,
        "data_root": root.display().to_string(),
        "version": {"e": key.e(), "s": key.s(), "c": key.c(), "t": key.t()},
        "command": command,
        "status": status,
        "started_at": started_at,
        "finished_at": finished_at,
        "stages": stages.iter().map(stage_record_to_json).collect::<Vec<_>>(),
        "error": error,
    });
    let path = run_dir.join("run_report.json");
    atomic_write_json_pretty(&path, &payload).map_err(|e| io_error(&path, e))
}

struct RunReportGuard {
    run_dir: PathBuf,
    run_id: String,
    done: bool,
}

impl RunReportGuard {
    fn new(run_dir: &Path, run_id: &str) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            run_id: run_id.to_string(),
            done: false,
        }
    }

    fn disarm(&mut self) {
        self.done = true;
    }
}

impl Drop for RunReportGuard {
    fn drop(&mut self) {
        if !self.done {
            let payload = json!({
                "schema_version": RUN_REPORT_SCHEMA,
                "run_id": self.run_id,
                "status": "failed",
                "finished_at": Utc::now().to_rfc3339(),
            });
            let _ = atomic_write_json_pretty(&self.run_dir.join("run_report.json"), &payload);
        }
    }
}

#[derive(Debug, Deserialize)]
struct StageStamp {
    schema_version: String,
    stage: String,
    fingerprint: String,
}

fn stamp_path_in(store_dir: &Path, slug: &str) -> PathBuf {
    store_dir
        .join(STORE_META_DIR)
        .join("stamps")
        .join(format!("{}.json", slug))
}

fn read_stamp_fingerprint(store_dir: &Path, slug: &str) -> Option<String> {
    let raw = fs::read_to_string(stamp_path_in(store_dir, slug)).ok()?;
    let stamp: StageStamp = serde_json::from_str(&raw).ok()?;
    if stamp.schema_version != STAMP_SCHEMA || stamp.stage != slug {
        return None;
    }
    Some(stamp.fingerprint)
}

fn write_stamp(store_dir: &Path, slug: &str, fingerprint: &str, run_id: &str) -> Result<()> {
    let payload = json!({
        "schema_version": STAMP_SCHEMA,
        "stage": slug,
        "fingerprint": fingerprint,
        "run_id": run_id,
        "recorded_at": Utc::now().to_rfc3339(),
    });
    let path = stamp_path_in(store_dir, slug);
    atomic_write_json_pretty(&path, &payload).map_err(|e| io_error(&path, e))
}

/// Fingerprint of a stage's input shape: slug, command prefix, params, and
/// the logical directory names of reads and writes. Volatile data (temp
/// paths, timestamps) never participates, so fingerprints are stable across
/// runs. The side-load fingerprint also folds in the source file listing so
/// new substrate0 entries re-trigger the merge.
fn stage_fingerprint(
    stage: &StageSpec,
    command: &[String],
    reads: &[ResolvedStore],
    writes: &[ResolvedStore],
) -> Result<String> {
    let read_names: BTreeMap<&str, &str> = reads
        .iter()
        .map(|s| (s.role.as_str(), s.dir_name.as_str()))
        .collect();
    let write_names: BTreeMap<&str, &str> = writes
        .iter()
        .map(|s| (s.role.as_str(), s.dir_name.as_str()))
        .collect();
    let mut payload = json!({
        "schema_version": FINGERPRINT_SCHEMA,
        "stage": stage.slug,
        "name": stage.kind.name(),
        "command": command,
        "params": stage.params,
        "reads": read_names,
        "writes": write_names,
    });
    if let StageKind::SideLoad { source } = &stage.kind {
        if let Some(store) = reads.iter().find(|s| s.role == *source) {
            payload["source_listing"] = Value::String(dir_listing_digest(&store.path)?);
        }
    }
    Ok(canonical_json_digest(&payload))
}

fn dir_listing_digest(dir: &Path) -> Result<String> {
    let mut names: Vec<String> = Vec::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry.map_err(|e| io_error(dir, e.into()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        names.push(rel.to_string_lossy().to_string());
    }
    names.sort();
    Ok(canonical_json_digest(&json!(names)))
}

enum CacheCheck {
    Satisfied(Option<String>),
    Stale,
}

fn cache_check(stage: &StageSpec, fingerprint: &str, writes: &[ResolvedStore]) -> CacheCheck {
    match stage.write_mode {
        WriteMode::Creates => {
            if writes.iter().any(|s| !s.is_satisfied()) {
                return CacheCheck::Stale;
            }
            let mut note = None;
            for store in writes {
                match read_stamp_fingerprint(&store.path, &stage.slug) {
                    Some(recorded) if recorded == fingerprint => {}
                    Some(_) => {
                        warn!(
                            stage = %stage.slug,
                            store = %store.dir_name,
                            "stamp mismatch; keeping existing store (use --force to rebuild)"
                        );
                        note = Some("stamp mismatch, kept".to_string());
                    }
                    None => {
                        note = Some(format!("adopted {}", store.dir_name));
                    }
                }
            }
            CacheCheck::Satisfied(note)
        }
        WriteMode::Amends => {
            for store in writes {
                match read_stamp_fingerprint(&store.path, &stage.slug) {
                    Some(recorded) if recorded == fingerprint => {}
                    _ => return CacheCheck::Stale,
                }
            }
            CacheCheck::Satisfied(None)
        }
    }
}

fn stage_argv(
    stage: &StageSpec,
    name: &str,
    reads: &[ResolvedStore],
    writes: &[ResolvedStore],
    temp_paths: &BTreeMap<Role, PathBuf>,
) -> Vec<String> {
    let mut argv = vec![name.to_string()];
    let mut named: BTreeSet<Role> = BTreeSet::new();
    for store in reads {
        if let Some(flag) = store.role.flag() {
            argv.push(flag.to_string());
            argv.push(store.path.display().to_string());
            named.insert(store.role);
        }
    }
    for store in writes {
        if named.contains(&store.role) {
            continue;
        }
        if let Some(flag) = store.role.flag() {
            let path = temp_paths.get(&store.role).unwrap_or(&store.path);
            argv.push(flag.to_string());
            argv.push(path.display().to_string());
        }
    }
    for (key, value) in &stage.params {
        argv.push(format!("--{}", key));
        argv.push(value.clone());
    }
    argv
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    Run,
    Forced,
    Cached,
    Adopted,
    MissingInput,
}

impl PlannedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannedAction::Run => "run",
            PlannedAction::Forced => "forced",
            PlannedAction::Cached => "cached",
            PlannedAction::Adopted => "adopted",
            PlannedAction::MissingInput => "missing-input",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedStage {
    pub slug: String,
    pub stage: String,
    pub action: PlannedAction,
    pub detail: Option<String>,
    pub reads: Vec<ResolvedStore>,
    pub writes: Vec<ResolvedStore>,
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub version: VersionKey,
    pub data_root: PathBuf,
    pub stages: Vec<PlannedStage>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub version: VersionKey,
    pub data_root: PathBuf,
    pub command: Vec<String>,
    pub stages: Vec<StageRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePresence {
    Present,
    Empty,
    Absent,
}

impl StorePresence {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorePresence::Present => "present",
            StorePresence::Empty => "empty",
            StorePresence::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub role: Role,
    pub dir_name: String,
    pub path: PathBuf,
    pub presence: StorePresence,
}

pub fn store_statuses(root: &Path, key: &VersionKey) -> Vec<StoreStatus> {
    ALL_ROLES
        .iter()
        .map(|role| {
            let store = ResolvedStore::resolve(root, *role, key);
            let presence = if store.is_satisfied() {
                StorePresence::Present
            } else if store.exists() {
                StorePresence::Empty
            } else {
                StorePresence::Absent
            };
            StoreStatus {
                role: *role,
                dir_name: store.dir_name,
                path: store.path,
                presence,
            }
        })
        .collect()
}

pub struct Orchestrator {
    root: PathBuf,
    key: VersionKey,
    pipeline: Pipeline,
    command: Vec<String>,
    force: bool,
    force_from_index: Option<usize>,
}

impl Orchestrator {
    pub fn new(
        root: &Path,
        key: VersionKey,
        pipeline: Pipeline,
        options: &RunOptions,
    ) -> Result<Self> {
        pipeline.validate()?;
        let root = fs::canonicalize(root).map_err(|_| {
            OrchestrationError::Configuration(format!(
                "data root {} does not exist or is not accessible",
                root.display()
            ))
        })?;
        if !root.is_dir() {
            return Err(OrchestrationError::Configuration(format!(
                "data root {} is not a directory",
                root.display()
            )));
        }
        let command = resolve_stage_command(&root, options.stage_cmd.as_deref())?;
        let force_from_index = match &options.force_from {
            Some(slug) => Some(pipeline.stage_index(slug).ok_or_else(|| {
                OrchestrationError::Configuration(format!(
                    "--force-from names unknown stage '{}'",
                    slug
                ))
            })?),
            None => None,
        };
        Ok(Self {
            root,
            key,
            pipeline,
            command,
            force: options.force,
            force_from_index,
        })
    }

    fn resolve(&self, roles: &[Role]) -> Vec<ResolvedStore> {
        roles
            .iter()
            .map(|r| ResolvedStore::resolve(&self.root, *r, &self.key))
            .collect()
    }

    fn is_forced(&self, index: usize) -> bool {
        self.force || self.force_from_index.map_or(false, |from| index >= from)
    }

    /// Dry-run walk: predicts each stage's action without touching any store,
    /// taking no lock and writing no report.
    pub fn plan(&self) -> Result<ExecutionPlan> {
        let mut planned = Vec::new();
        let mut produced: BTreeSet<Role> = BTreeSet::new();
        let mut fresh: BTreeSet<Role> = BTreeSet::new();
        for (index, stage) in self.pipeline.stages.iter().enumerate() {
            let reads = self.resolve(&stage.reads);
            let writes = self.resolve(&stage.writes);
            let missing = reads
                .iter()
                .find(|s| !s.is_satisfied() && !produced.contains(&s.role));
            let (action, detail) = if let Some(store) = missing {
                (
                    PlannedAction::MissingInput,
                    Some(format!("{} at {}", store.role.as_str(), store.path.display())),
                )
            } else if self.is_forced(index) {
                (PlannedAction::Forced, None)
            } else {
                self.predict_unforced(stage, &reads, &writes, &fresh)?
            };
            match action {
                PlannedAction::Run | PlannedAction::Forced => {
                    for store in &writes {
                        produced.insert(store.role);
                        if stage.write_mode == WriteMode::Creates {
                            fresh.insert(store.role);
                        }
                    }
                }
                PlannedAction::Cached | PlannedAction::Adopted => {
                    for store in &writes {
                        produced.insert(store.role);
                    }
                }
                PlannedAction::MissingInput => {}
            }
            planned.push(PlannedStage {
                slug: stage.slug.clone(),
                stage: stage.kind.name().to_string(),
                action,
                detail,
                reads,
                writes,
            });
        }
        Ok(ExecutionPlan {
            version: self.key.clone(),
            data_root: self.root.clone(),
            stages: planned,
        })
    }

    fn predict_unforced(
        &self,
        stage: &StageSpec,
        reads: &[ResolvedStore],
        writes: &[ResolvedStore],
        fresh: &BTreeSet<Role>,
    ) -> Result<(PlannedAction, Option<String>)> {
        let fingerprint = stage_fingerprint(stage, &self.command, reads, writes)?;
        match stage.write_mode {
            WriteMode::Creates => {
                if writes.iter().any(|s| !s.is_satisfied()) {
                    return Ok((PlannedAction::Run, None));
                }
                let mut action = PlannedAction::Cached;
                let mut detail = None;
                for store in writes {
                    match read_stamp_fingerprint(&store.path, &stage.slug) {
                        Some(recorded) if recorded == fingerprint => {}
                        Some(_) => {
                            detail = Some("stamp mismatch, kept".to_string());
                        }
                        None => {
                            action = PlannedAction::Adopted;
                            detail = Some(format!("{} supplied out-of-band", store.dir_name));
                        }
                    }
                }
                Ok((action, detail))
            }
            WriteMode::Amends => {
                for store in writes {
                    if fresh.contains(&store.role) {
                        return Ok((PlannedAction::Run, None));
                    }
                    match read_stamp_fingerprint(&store.path, &stage.slug) {
                        Some(recorded) if recorded == fingerprint => {}
                        _ => return Ok((PlannedAction::Run, None)),
                    }
                }
                Ok((PlannedAction::Cached, None))
            }
        }
    }

    pub fn run(&self) -> Result<RunOutcome> {
        let _lock = acquire_run_lock(&self.root)?;
        let runs_root = self.root.join(STORE_META_DIR).join("runs");
        let base = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let mut run_id = base.clone();
        let mut counter = 1;
        while runs_root.join(&run_id).exists() {
            counter += 1;
            run_id = format!("{}-{}", base, counter);
        }
        let run_dir = runs_root.join(&run_id);
        ensure_dir(&run_dir).map_err(|e| io_error(&run_dir, e))?;
        let started_at = Utc::now().to_rfc3339();
        info!(run_id = %run_id, version = %self.key, root = %self.root.display(), "pipeline run starting");
        let mut records: Vec<StageRecord> = Vec::new();
        write_run_report(
            &run_dir,
            &run_id,
            &self.root,
            &self.key,
            &self.command,
            "running",
            &started_at,
            None,
            &records,
            None,
        )?;
        let mut guard = RunReportGuard::new(&run_dir, &run_id);
        let result = self.execute_stages(&run_id, &mut records);
        let finished_at = Utc::now().to_rfc3339();
        match result {
            Ok(()) => {
                write_run_report(
                    &run_dir,
                    &run_id,
                    &self.root,
                    &self.key,
                    &self.command,
                    "succeeded",
                    &started_at,
                    Some(&finished_at),
                    &records,
                    None,
                )?;
                guard.disarm();
                info!(run_id = %run_id, "pipeline run succeeded");
                Ok(RunOutcome {
                    run_id,
                    run_dir,
                    version: self.key.clone(),
                    data_root: self.root.clone(),
                    command: self.command.clone(),
                    stages: records,
                })
            }
            Err(err) => {
                let _ = write_run_report(
                    &run_dir,
                    &run_id,
                    &self.root,
                    &self.key,
                    &self.command,
                    "failed",
                    &started_at,
                    Some(&finished_at),
                    &records,
                    Some(&err.to_string()),
                );
                guard.disarm();
                error!(run_id = %run_id, error = %err, "pipeline run failed");
                Err(err)
            }
        }
    }

    fn execute_stages(&self, run_id: &str, records: &mut Vec<StageRecord>) -> Result<()> {
        for (index, stage) in self.pipeline.stages.iter().enumerate() {
            let reads = self.resolve(&stage.reads);
            let writes = self.resolve(&stage.writes);
            for store in &reads {
                if !store.is_satisfied() {
                    records.push(record_for(
                        stage,
                        StageState::Failed,
                        Some(format!("missing input {}", store.role.as_str())),
                        0.0,
                        &reads,
                        &writes,
                    ));
                    return Err(OrchestrationError::MissingInput {
                        stage: stage.slug.clone(),
                        store: store.role.as_str().to_string(),
                        path: store.path.clone(),
                    });
                }
            }
            let forced = self.is_forced(index);
            let fingerprint = stage_fingerprint(stage, &self.command, &reads, &writes)?;
            if !forced {
                if let CacheCheck::Satisfied(note) = cache_check(stage, &fingerprint, &writes) {
                    info!(stage = %stage.slug, state = StageState::Cached.as_str(), "stage satisfied");
                    records.push(record_for(
                        stage,
                        StageState::Cached,
                        note,
                        0.0,
                        &reads,
                        &writes,
                    ));
                    continue;
                }
            }
            let started = Instant::now();
            info!(stage = %stage.slug, state = StageState::Running.as_str(), forced, "stage starting");
            let note = if forced {
                Some("forced".to_string())
            } else {
                None
            };
            match self.run_stage(stage, run_id, &fingerprint, forced, &reads, &writes) {
                Ok(()) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    info!(
                        stage = %stage.slug,
                        state = StageState::Succeeded.as_str(),
                        elapsed_seconds = elapsed,
                        "stage finished"
                    );
                    records.push(record_for(
                        stage,
                        StageState::Succeeded,
                        note,
                        elapsed,
                        &reads,
                        &writes,
                    ));
                }
                Err(err) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    error!(stage = %stage.slug, state = StageState::Failed.as_str(), error = %err, "stage failed");
                    records.push(record_for(
                        stage,
                        StageState::Failed,
                        Some(err.to_string()),
                        elapsed,
                        &reads,
                        &writes,
                    ));
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn run_stage(
        &self,
        stage: &StageSpec,
        run_id: &str,
        fingerprint: &str,
        forced: bool,
        reads: &[ResolvedStore],
        writes: &[ResolvedStore],
    ) -> Result<()> {
        match &stage.kind {
            StageKind::SideLoad { source } => {
                self.run_side_load(stage, run_id, fingerprint, *source, reads, writes)
            }
            StageKind::Command(name) => match stage.write_mode {
                WriteMode::Creates => self.run_creating_command(
                    stage,
                    name,
                    run_id,
                    fingerprint,
                    forced,
                    reads,
                    writes,
                ),
                WriteMode::Amends => {
                    self.run_amending_command(stage, name, run_id, fingerprint, reads, writes)
                }
            },
        }
    }

    fn run_side_load(
        &self,
        stage: &StageSpec,
        run_id: &str,
        fingerprint: &str,
        source: Role,
        reads: &[ResolvedStore],
        writes: &[ResolvedStore],
    ) -> Result<()> {
        let source_store = reads.iter().find(|s| s.role == source).ok_or_else(|| {
            OrchestrationError::Configuration(format!(
                "stage '{}' does not read its side-load source",
                stage.slug
            ))
        })?;
        for store in writes {
            let copied = merge_missing_entries(&source_store.path, &store.path)?;
            info!(stage = %stage.slug, store = %store.dir_name, copied, "side-load merged");
            write_stamp(&store.path, &stage.slug, fingerprint, run_id)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_creating_command(
        &self,
        stage: &StageSpec,
        name: &str,
        run_id: &str,
        fingerprint: &str,
        forced: bool,
        reads: &[ResolvedStore],
        writes: &[ResolvedStore],
    ) -> Result<()> {
        let ts = Utc::now().timestamp_micros();
        let pid = std::process::id();
        let mut temp_paths: BTreeMap<Role, PathBuf> = BTreeMap::new();
        for store in writes {
            let temp = self
                .root
                .join(format!(".{}.tmp.{}.{}", store.dir_name, pid, ts));
            ensure_dir(&temp).map_err(|e| io_error(&temp, e))?;
            temp_paths.insert(store.role, temp);
        }
        let argv = stage_argv(stage, name, reads, writes, &temp_paths);
        // On failure the staged temp directory is kept for inspection.
        self.spawn_stage(stage, run_id, &argv)?;
        for store in writes {
            let temp = &temp_paths[&store.role];
            write_stamp(temp, &stage.slug, fingerprint, run_id)?;
            if store.path.exists() {
                if forced {
                    let aside = self
                        .root
                        .join(format!(".{}.replaced.{}.{}", store.dir_name, pid, ts));
                    fs::rename(&store.path, &aside).map_err(|e| {
                        OrchestrationError::PartialWrite {
                            path: store.path.clone(),
                            message: format!(
                                "could not move existing store aside to {}: {}",
                                aside.display(),
                                e
                            ),
                        }
                    })?;
                    warn!(
                        stage = %stage.slug,
                        store = %store.dir_name,
                        aside = %aside.display(),
                        "existing store moved aside"
                    );
                } else if fs::remove_dir(&store.path).is_err() {
                    // Only an empty directory may stand in the way of an
                    // unforced publish.
                    return Err(OrchestrationError::PartialWrite {
                        path: store.path.clone(),
                        message: format!(
                            "store is no longer empty; staged output left at {}",
                            temp.display()
                        ),
                    });
                }
            }
            fs::rename(temp, &store.path).map_err(|e| OrchestrationError::PartialWrite {
                path: store.path.clone(),
                message: format!("could not publish staged output {}: {}", temp.display(), e),
            })?;
            if let Some(parent) = store.path.parent() {
                if let Ok(dir) = fs::File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
        }
        Ok(())
    }

    fn run_amending_command(
        &self,
        stage: &StageSpec,
        name: &str,
        run_id: &str,
        fingerprint: &str,
        reads: &[ResolvedStore],
        writes: &[ResolvedStore],
    ) -> Result<()> {
        let argv = stage_argv(stage, name, reads, writes, &BTreeMap::new());
        self.spawn_stage(stage, run_id, &argv)?;
        for store in writes {
            write_stamp(&store.path, &stage.slug, fingerprint, run_id)?;
        }
        Ok(())
    }

    fn spawn_stage(&self, stage: &StageSpec, run_id: &str, argv: &[String]) -> Result<()> {
        let mut full: Vec<String> = self.command.clone();
        full.extend(argv.iter().cloned());
        info!(stage = %stage.slug, command = ?full, "spawning stage command");
        let mut cmd = Command::new(&full[0]);
        cmd.args(&full[1..]);
        cmd.current_dir(&self.root);
        cmd.env("RETORT_STAGE", &stage.slug);
        cmd.env("RETORT_RUN_ID", run_id);
        cmd.env("RETORT_DATA_ROOT", &self.root);
        let status = cmd.status().map_err(|e| OrchestrationError::StageExecution {
            stage: stage.slug.clone(),
            status: format!("spawn failed: {}", e),
            command: full.join(" "),
        })?;
        if !status.success() {
            return Err(OrchestrationError::StageExecution {
                stage: stage.slug.clone(),
                status: status.to_string(),
                command: full.join(" "),
            });
        }
        Ok(())
    }
}

/// Merge `src` into `dst`, copying only entries whose relative path does not
/// already exist in `dst`. Existing files are never overwritten. Symlinked
/// content is copied through; orchestrator metadata is skipped.
fn merge_missing_entries(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0usize;
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        if rel.as_os_str().is_empty() {
            return true;
        }
        !rel.starts_with(STORE_META_DIR)
    });
    for entry in walker {
        let entry = entry.map_err(|e| io_error(src, e.into()))?;
        let path = entry.path();
        let rel = path.strip_prefix(src).unwrap_or(path);
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target).map_err(|e| io_error(&target, e))?;
        } else if target.exists() {
            continue;
        } else if entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent).map_err(|e| io_error(parent, e))?;
            }
            match fs::canonicalize(path) {
                Ok(real) if real.is_file() => {
                    fs::copy(&real, &target).map_err(|e| io_error(&target, e))?;
                    copied += 1;
                }
                Ok(real) if real.is_dir() => {
                    copied += merge_missing_entries(&real, &target)?;
                }
                Ok(_) => {}
                Err(_) => {
                    let link_target = fs::read_link(path).map_err(|e| io_error(path, e))?;
                    #[cfg(unix)]
                    {
                        symlink(&link_target, &target).map_err(|e| io_error(&target, e))?;
                        copied += 1;
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = link_target;
                    }
                }
            }
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent).map_err(|e| io_error(parent, e))?;
            }
            fs::copy(path, &target).map_err(|e| io_error(&target, e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

pub fn run_pipeline(root: &Path, key: VersionKey, options: &RunOptions) -> Result<RunOutcome> {
    Orchestrator::new(root, key, Pipeline::standard(), options)?.run()
}

pub fn plan_pipeline(root: &Path, key: VersionKey, options: &RunOptions) -> Result<ExecutionPlan> {
    Orchestrator::new(root, key, Pipeline::standard(), options)?.plan()
}
