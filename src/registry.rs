//! Model registry: the authoritative table of available models
//!
//! Merges probe results and detected cloud credentials into one snapshot,
//! swapped atomically on refresh. Reads always see either the pre- or
//! post-refresh table, never a mixture. The snapshot is persisted as JSON
//! after every refresh and reloaded (marked stale) on restart.

use crate::config::{Config, ModelPricing};
use crate::error::{AppResult, RouterError};
use crate::probe::{self, Capabilities, RuntimeDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default context window assumed for local models that do not report one.
const LOCAL_DEFAULT_CONTEXT: u32 = 8192;

/// Model providers the router can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Anthropic,
    Openai,
    Google,
    Openrouter,
    Moonshot,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::Anthropic => "anthropic",
            Provider::Openai => "openai",
            Provider::Google => "google",
            Provider::Openrouter => "openrouter",
            Provider::Moonshot => "moonshot",
        }
    }

    pub fn is_cloud(&self) -> bool {
        !matches!(self, Provider::Local)
    }

    /// Environment variable carrying this provider's credential.
    pub fn env_key(&self) -> Option<&'static str> {
        match self {
            Provider::Local => None,
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Openai => Some("OPENAI_API_KEY"),
            Provider::Google => Some("GOOGLE_API_KEY"),
            Provider::Openrouter => Some("OPENROUTER_API_KEY"),
            Provider::Moonshot => Some("MOONSHOT_API_KEY"),
        }
    }

    /// Default API base URL for the provider.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Local => "http://localhost:1234/v1",
            Provider::Anthropic => "https://api.anthropic.com",
            Provider::Openai => "https://api.openai.com/v1",
            Provider::Google => "https://generativelanguage.googleapis.com/v1beta",
            Provider::Openrouter => "https://openrouter.ai/api/v1",
            Provider::Moonshot => "https://api.moonshot.ai/v1",
        }
    }

    /// Effective base URL: a `<PROVIDER>_BASE_URL` environment variable
    /// overrides the default, which lets operators point a provider at a
    /// proxy or a test double.
    pub fn base_url(&self) -> String {
        let env_name = match self {
            Provider::Local => None,
            Provider::Anthropic => Some("ANTHROPIC_BASE_URL"),
            Provider::Openai => Some("OPENAI_BASE_URL"),
            Provider::Google => Some("GOOGLE_BASE_URL"),
            Provider::Openrouter => Some("OPENROUTER_BASE_URL"),
            Provider::Moonshot => Some("MOONSHOT_BASE_URL"),
        };
        env_name
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.default_base_url().to_string())
    }

    /// Last-known list prices per million tokens, used when the operator has
    /// not configured pricing for a cloud model. Cloud entries must never
    /// carry zero pricing.
    pub fn default_pricing(&self) -> ModelPricing {
        match self {
            Provider::Local => ModelPricing {
                input: 0.0,
                output: 0.0,
            },
            Provider::Anthropic => ModelPricing {
                input: 3.0,
                output: 15.0,
            },
            Provider::Openai => ModelPricing {
                input: 2.5,
                output: 10.0,
            },
            Provider::Google => ModelPricing {
                input: 1.25,
                output: 10.0,
            },
            Provider::Openrouter => ModelPricing {
                input: 3.0,
                output: 15.0,
            },
            Provider::Moonshot => ModelPricing {
                input: 2.0,
                output: 8.0,
            },
        }
    }

    /// Context window assumed when the provider does not report one.
    pub fn default_context(&self) -> u32 {
        match self {
            Provider::Local => LOCAL_DEFAULT_CONTEXT,
            Provider::Anthropic => 200_000,
            Provider::Google => 1_000_000,
            _ => 128_000,
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Provider::Local),
            "anthropic" => Ok(Provider::Anthropic),
            "openai" => Ok(Provider::Openai),
            "google" => Ok(Provider::Google),
            "openrouter" => Ok(Provider::Openrouter),
            "moonshot" => Ok(Provider::Moonshot),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// A model reference as written in configuration or requests.
///
/// Grammar: `local`, `cloud`, `claude` (alias of `cloud`), or
/// `provider:id` where provider is `cloud` or a concrete provider name.
/// The original spelling is preserved for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    raw: String,
}

/// What a reference points at, once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefTarget {
    /// First reachable local entry, preferring the configured id
    Local,
    /// The configured default cloud entry
    DefaultCloud,
    /// A specific model id on the default cloud provider
    Cloud(String),
    /// A fully qualified provider:id pair
    Exact(Provider, String),
}

impl ModelRef {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let r = Self {
            raw: raw.to_string(),
        };
        r.target_checked()?;
        Ok(r)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed target. Infallible because construction validates.
    pub fn target(&self) -> RefTarget {
        self.target_checked()
            .expect("ModelRef::parse validated the grammar")
    }

    fn target_checked(&self) -> AppResult<RefTarget> {
        match self.raw.as_str() {
            "" => Err(RouterError::Validation(
                "model reference cannot be empty".to_string(),
            )),
            "local" => Ok(RefTarget::Local),
            "cloud" | "claude" => Ok(RefTarget::DefaultCloud),
            other => {
                let parts: Vec<&str> = other.split(':').collect();
                if parts.len() != 2 || parts[1].is_empty() {
                    return Err(RouterError::Validation(format!(
                        "model reference '{other}' must be 'local', 'cloud', or 'provider:id'"
                    )));
                }
                if parts[0] == "cloud" {
                    return Ok(RefTarget::Cloud(parts[1].to_string()));
                }
                let provider = Provider::from_str(parts[0])
                    .map_err(|e| RouterError::Validation(format!("model reference '{other}': {e}")))?;
                Ok(RefTarget::Exact(provider, parts[1].to_string()))
            }
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One loadable model known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub display_name: String,
    /// Descriptor of the hosting runtime; `None` for cloud models.
    pub runtime: Option<RuntimeDescriptor>,
    pub provider: Provider,
    pub capabilities: Capabilities,
    pub context_tokens: u32,
    /// Per-million-token prices; zero for local entries.
    pub pricing: ModelPricing,
}

impl ModelEntry {
    /// Registry key: `provider:id`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider.as_str(), self.id)
    }

    pub fn is_local(&self) -> bool {
        self.provider == Provider::Local
    }

    pub fn is_reachable_local(&self) -> bool {
        self.is_local() && self.runtime.as_ref().map(|r| r.reachable).unwrap_or(false)
    }
}

/// Defaults the lookup needs to resolve `local` and `cloud` references.
#[derive(Debug, Clone)]
pub struct LookupDefaults {
    pub preferred_local_id: Option<String>,
    pub default_cloud_provider: Provider,
    pub default_cloud_model: String,
}

impl LookupDefaults {
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let (provider, model) = config.default_cloud()?;
        Ok(Self {
            preferred_local_id: config.models.local.model.clone(),
            default_cloud_provider: provider,
            default_cloud_model: model,
        })
    }
}

/// An immutable view of the registry at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub entries: BTreeMap<String, ModelEntry>,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub ttl_seconds: u64,
    /// False until the first in-process refresh completes; a snapshot loaded
    /// from disk is stale regardless of its recorded scan time.
    #[serde(skip)]
    pub refreshed: bool,
}

impl RegistrySnapshot {
    fn empty(ttl_seconds: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            last_scan_at: None,
            ttl_seconds,
            refreshed: false,
        }
    }

    /// A stale table may be read, but the operator log must hear about it.
    pub fn is_stale(&self) -> bool {
        if !self.refreshed {
            return true;
        }
        match self.last_scan_at {
            None => true,
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                age > chrono::Duration::seconds(self.ttl_seconds as i64)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn list_all(&self) -> Vec<&ModelEntry> {
        self.entries.values().collect()
    }

    pub fn list_local(&self) -> Vec<&ModelEntry> {
        self.entries.values().filter(|e| e.is_local()).collect()
    }

    pub fn list_cloud(&self) -> Vec<&ModelEntry> {
        self.entries.values().filter(|e| !e.is_local()).collect()
    }

    /// Resolve a reference against this snapshot.
    pub fn lookup(&self, reference: &ModelRef, defaults: &LookupDefaults) -> Option<&ModelEntry> {
        match reference.target() {
            RefTarget::Local => {
                let reachable: Vec<&ModelEntry> = self
                    .entries
                    .values()
                    .filter(|e| e.is_reachable_local())
                    .collect();
                if let Some(preferred) = &defaults.preferred_local_id {
                    if let Some(entry) = reachable.iter().find(|e| &e.id == preferred) {
                        return Some(entry);
                    }
                }
                reachable.first().copied()
            }
            RefTarget::DefaultCloud => self.entries.get(&format!(
                "{}:{}",
                defaults.default_cloud_provider.as_str(),
                defaults.default_cloud_model
            )),
            RefTarget::Cloud(id) => {
                let key = format!("{}:{}", defaults.default_cloud_provider.as_str(), id);
                self.entries.get(&key).or_else(|| {
                    self.entries
                        .values()
                        .find(|e| e.provider.is_cloud() && e.id == id)
                })
            }
            RefTarget::Exact(provider, id) => {
                let entry = self.entries.get(&format!("{}:{id}", provider.as_str()))?;
                if entry.is_local() && !entry.is_reachable_local() {
                    return None;
                }
                Some(entry)
            }
        }
    }

    /// The largest context window across all entries, used by the
    /// context-overflow check.
    pub fn largest_context(&self) -> u32 {
        self.entries
            .values()
            .map(|e| e.context_tokens)
            .max()
            .unwrap_or(0)
    }

    /// Any entry whose context window fits the estimate, preferring cloud
    /// entries (they carry the larger windows).
    pub fn entry_with_context(&self, needed: u64) -> Option<&ModelEntry> {
        self.entries
            .values()
            .filter(|e| u64::from(e.context_tokens) >= needed)
            .max_by_key(|e| (e.provider.is_cloud(), e.context_tokens))
    }
}

/// Change set delivered to observers after a refresh.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl RegistryChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Process-wide registry with snapshot-swap semantics.
///
/// Reads take the lock only long enough to clone an `Arc`; the refresh path
/// does all probing before acquiring the write lock, so no lock is ever held
/// across a suspension point.
pub struct Registry {
    inner: RwLock<Arc<RegistrySnapshot>>,
    observers: Mutex<Vec<mpsc::UnboundedSender<RegistryChange>>>,
    snapshot_path: PathBuf,
    ttl_seconds: u64,
}

impl Registry {
    /// Create a registry, seeding it from the persisted snapshot when one
    /// exists. The seeded table is marked stale until the first refresh.
    pub fn new(ttl_seconds: u64, snapshot_path: PathBuf) -> Self {
        let initial = match Self::load_snapshot(&snapshot_path, ttl_seconds) {
            Some(snapshot) => {
                tracing::info!(
                    path = %snapshot_path.display(),
                    entries = snapshot.entries.len(),
                    "Loaded registry snapshot (stale until first refresh)"
                );
                snapshot
            }
            None => RegistrySnapshot::empty(ttl_seconds),
        };

        Self {
            inner: RwLock::new(Arc::new(initial)),
            observers: Mutex::new(Vec::new()),
            snapshot_path,
            ttl_seconds,
        }
    }

    fn load_snapshot(path: &PathBuf, ttl_seconds: u64) -> Option<RegistrySnapshot> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<RegistrySnapshot>(&content) {
            Ok(mut snapshot) => {
                snapshot.ttl_seconds = ttl_seconds;
                snapshot.refreshed = false;
                Some(snapshot)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable registry snapshot");
                None
            }
        }
    }

    /// Current table. Stale reads are permitted but warn the operator.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let snapshot = self
            .inner
            .read()
            .expect("registry lock poisoned")
            .clone();
        if snapshot.is_stale() {
            tracing::warn!(
                last_scan = ?snapshot.last_scan_at,
                ttl_seconds = snapshot.ttl_seconds,
                "Registry snapshot is stale; serving anyway"
            );
        }
        snapshot
    }

    /// Current table without the staleness warning, for display endpoints
    /// that report staleness themselves.
    pub fn snapshot_unchecked(&self) -> Arc<RegistrySnapshot> {
        self.inner.read().expect("registry lock poisoned").clone()
    }

    /// Replace the table wholesale, without probing. Restore tooling and
    /// tests use this; the probe loop goes through [`Registry::refresh`].
    pub fn install_snapshot(&self, snapshot: RegistrySnapshot) {
        let mut guard = self.inner.write().expect("registry lock poisoned");
        *guard = Arc::new(snapshot);
    }

    /// Register an observer. Each refresh delivers its non-empty change set.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .push(tx);
        rx
    }

    /// Probe all runtimes and detected cloud credentials, diff against the
    /// current table, swap atomically, persist, and notify observers.
    pub async fn refresh(&self, config: &Config, client: &reqwest::Client) -> RegistryChange {
        let targets = probe::scan_targets(
            &config.models.local.endpoint,
            &config.scanner.allowed_hosts,
        );
        let timeout = Duration::from_secs(config.scanner.probe_timeout_seconds);
        let reports =
            probe::probe_all(client, targets, timeout, &config.scanner.allowed_hosts).await;

        let mut entries = BTreeMap::new();
        for report in &reports {
            if !report.descriptor.reachable {
                continue;
            }
            for stub in &report.models {
                let entry = ModelEntry {
                    id: stub.id.clone(),
                    display_name: stub.display_name.clone(),
                    runtime: Some(report.descriptor.clone()),
                    provider: Provider::Local,
                    capabilities: stub.capabilities,
                    context_tokens: LOCAL_DEFAULT_CONTEXT,
                    pricing: ModelPricing {
                        input: 0.0,
                        output: 0.0,
                    },
                };
                entries.insert(entry.key(), entry);
            }
        }

        for entry in cloud_entries_from_config(config) {
            entries.insert(entry.key(), entry);
        }

        let change = {
            let mut guard = self.inner.write().expect("registry lock poisoned");
            let old = guard.clone();
            let change = diff_tables(&old.entries, &entries);
            let snapshot = RegistrySnapshot {
                entries,
                last_scan_at: Some(Utc::now()),
                ttl_seconds: self.ttl_seconds,
                refreshed: true,
            };
            *guard = Arc::new(snapshot);
            change
        };

        self.persist();

        tracing::info!(
            added = change.added.len(),
            removed = change.removed.len(),
            updated = change.updated.len(),
            "Registry refresh complete"
        );

        if !change.is_empty() {
            let mut observers = self.observers.lock().expect("observer lock poisoned");
            observers.retain(|tx| tx.send(change.clone()).is_ok());
        }

        change
    }

    /// Write the current table to disk via temp-file + rename so readers of
    /// the file never see a torn snapshot.
    fn persist(&self) {
        let snapshot = self.snapshot_unchecked();
        if let Some(parent) = self.snapshot_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(error = %e, "Could not create registry snapshot directory");
                return;
            }
        }
        let json = match serde_json::to_string_pretty(snapshot.as_ref()) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "Could not serialize registry snapshot");
                return;
            }
        };
        let tmp = self.snapshot_path.with_extension("json.tmp");
        let result = std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &self.snapshot_path));
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            tracing::warn!(
                path = %self.snapshot_path.display(),
                error = %e,
                "Could not persist registry snapshot"
            );
        }
    }
}

/// Compute the (added, removed, updated) sets between two tables.
///
/// `last_probed_at` alone does not count as a change, otherwise every
/// refresh would report the whole table as updated.
fn diff_tables(
    old: &BTreeMap<String, ModelEntry>,
    new: &BTreeMap<String, ModelEntry>,
) -> RegistryChange {
    let mut change = RegistryChange::default();
    for (key, entry) in new {
        match old.get(key) {
            None => change.added.push(key.clone()),
            Some(previous) => {
                if entry_changed(previous, entry) {
                    change.updated.push(key.clone());
                }
            }
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            change.removed.push(key.clone());
        }
    }
    change
}

fn entry_changed(old: &ModelEntry, new: &ModelEntry) -> bool {
    let reachable = |e: &ModelEntry| e.runtime.as_ref().map(|r| r.reachable);
    old.display_name != new.display_name
        || old.capabilities != new.capabilities
        || old.context_tokens != new.context_tokens
        || old.pricing != new.pricing
        || reachable(old) != reachable(new)
}

/// Cloud entries derived from configuration and credential presence.
///
/// A provider contributes entries only when its `*_API_KEY` environment
/// variable is set; the candidate model set is every cloud model the
/// configuration can reach (default cloud model, chain entries, hard rules).
pub fn cloud_entries_from_config(config: &Config) -> Vec<ModelEntry> {
    let mut candidates: Vec<(Provider, String)> = Vec::new();

    let default_cloud = match config.default_cloud() {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping cloud detection: no valid default provider");
            return Vec::new();
        }
    };
    candidates.push(default_cloud.clone());

    let mut add_ref = |raw: &str| {
        if let Ok(reference) = ModelRef::parse(raw) {
            match reference.target() {
                RefTarget::Cloud(id) => candidates.push((default_cloud.0, id)),
                RefTarget::Exact(provider, id) if provider.is_cloud() => {
                    candidates.push((provider, id))
                }
                _ => {}
            }
        }
    };
    for raw in &config.fallback.chain {
        add_ref(raw);
    }
    for rule in &config.routing.hard_rules {
        add_ref(&rule.model);
    }

    candidates.sort();
    candidates.dedup();

    let mut entries = Vec::new();
    for (provider, id) in candidates {
        let Some(env_key) = provider.env_key() else {
            continue;
        };
        let has_key = std::env::var(env_key).map(|v| !v.is_empty()).unwrap_or(false);
        if !has_key {
            tracing::debug!(provider = provider.as_str(), env_key, "No credential, skipping");
            continue;
        }

        let mut pricing = config
            .pricing_for(&id)
            .unwrap_or_else(|| provider.default_pricing());
        if pricing.input == 0.0 && pricing.output == 0.0 {
            tracing::warn!(
                provider = provider.as_str(),
                model = %id,
                "Configured zero pricing for a cloud model; using provider defaults"
            );
            pricing = provider.default_pricing();
        }

        let mut capabilities = probe::infer_capabilities(&id);
        capabilities.vision |= matches!(
            provider,
            Provider::Anthropic | Provider::Openai | Provider::Google
        );

        entries.push(ModelEntry {
            id: id.clone(),
            display_name: id,
            runtime: None,
            provider,
            capabilities,
            context_tokens: provider.default_context(),
            pricing,
        });
    }
    entries
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::RuntimeKind;

    pub(crate) fn local_entry(id: &str, reachable: bool) -> ModelEntry {
        ModelEntry {
            id: id.to_string(),
            display_name: id.to_string(),
            runtime: Some(RuntimeDescriptor {
                kind: RuntimeKind::Lmstudio,
                base_url: "http://localhost:1234".to_string(),
                reachable,
                last_probed_at: Some(Utc::now()),
            }),
            provider: Provider::Local,
            capabilities: probe::infer_capabilities(id),
            context_tokens: 8192,
            pricing: ModelPricing {
                input: 0.0,
                output: 0.0,
            },
        }
    }

    pub(crate) fn cloud_entry(provider: Provider, id: &str) -> ModelEntry {
        ModelEntry {
            id: id.to_string(),
            display_name: id.to_string(),
            runtime: None,
            provider,
            capabilities: Capabilities {
                text: true,
                vision: true,
                reasoning: true,
                tools: true,
            },
            context_tokens: provider.default_context(),
            pricing: provider.default_pricing(),
        }
    }

    fn snapshot_with(entries: Vec<ModelEntry>) -> RegistrySnapshot {
        RegistrySnapshot {
            entries: entries.into_iter().map(|e| (e.key(), e)).collect(),
            last_scan_at: Some(Utc::now()),
            ttl_seconds: 300,
            refreshed: true,
        }
    }

    fn defaults() -> LookupDefaults {
        LookupDefaults {
            preferred_local_id: Some("qwen3-4b".to_string()),
            default_cloud_provider: Provider::Anthropic,
            default_cloud_model: "claude-sonnet-4-5".to_string(),
        }
    }

    #[test]
    fn model_ref_grammar() {
        assert_eq!(ModelRef::parse("local").unwrap().target(), RefTarget::Local);
        assert_eq!(
            ModelRef::parse("cloud").unwrap().target(),
            RefTarget::DefaultCloud
        );
        assert_eq!(
            ModelRef::parse("claude").unwrap().target(),
            RefTarget::DefaultCloud
        );
        assert_eq!(
            ModelRef::parse("cloud:claude-sonnet-4-5").unwrap().target(),
            RefTarget::Cloud("claude-sonnet-4-5".to_string())
        );
        assert_eq!(
            ModelRef::parse("local:qwen3-4b").unwrap().target(),
            RefTarget::Exact(Provider::Local, "qwen3-4b".to_string())
        );
        assert_eq!(
            ModelRef::parse("anthropic:claude-sonnet-4-5").unwrap().target(),
            RefTarget::Exact(Provider::Anthropic, "claude-sonnet-4-5".to_string())
        );

        assert!(ModelRef::parse("").is_err());
        assert!(ModelRef::parse("ftp:x:y").is_err());
        assert!(ModelRef::parse("carrier-pigeon:x").is_err());
        assert!(ModelRef::parse("anthropic:").is_err());
    }

    #[test]
    fn model_ref_display_preserves_spelling() {
        let r = ModelRef::parse("cloud:claude-sonnet-4-5").unwrap();
        assert_eq!(r.to_string(), "cloud:claude-sonnet-4-5");
    }

    #[test]
    fn lookup_local_prefers_configured_id() {
        let snapshot = snapshot_with(vec![
            local_entry("aaa-first", true),
            local_entry("qwen3-4b", true),
        ]);
        let entry = snapshot
            .lookup(&ModelRef::parse("local").unwrap(), &defaults())
            .unwrap();
        assert_eq!(entry.id, "qwen3-4b");
    }

    #[test]
    fn lookup_local_falls_back_to_first_reachable() {
        let snapshot = snapshot_with(vec![
            local_entry("aaa-first", true),
            local_entry("zzz-last", true),
        ]);
        let mut d = defaults();
        d.preferred_local_id = Some("not-loaded".to_string());
        let entry = snapshot
            .lookup(&ModelRef::parse("local").unwrap(), &d)
            .unwrap();
        assert_eq!(entry.id, "aaa-first");
    }

    #[test]
    fn lookup_local_ignores_unreachable() {
        let snapshot = snapshot_with(vec![local_entry("qwen3-4b", false)]);
        assert!(snapshot
            .lookup(&ModelRef::parse("local").unwrap(), &defaults())
            .is_none());
    }

    #[test]
    fn lookup_cloud_alias_resolves_default() {
        let snapshot = snapshot_with(vec![cloud_entry(Provider::Anthropic, "claude-sonnet-4-5")]);
        let entry = snapshot
            .lookup(&ModelRef::parse("cloud").unwrap(), &defaults())
            .unwrap();
        assert_eq!(entry.provider, Provider::Anthropic);
        let entry = snapshot
            .lookup(&ModelRef::parse("claude").unwrap(), &defaults())
            .unwrap();
        assert_eq!(entry.id, "claude-sonnet-4-5");
    }

    #[test]
    fn lookup_cloud_qualified_scans_other_providers() {
        let snapshot = snapshot_with(vec![cloud_entry(Provider::Openai, "gpt-4o")]);
        let entry = snapshot
            .lookup(&ModelRef::parse("cloud:gpt-4o").unwrap(), &defaults())
            .unwrap();
        assert_eq!(entry.provider, Provider::Openai);
    }

    #[test]
    fn registry_invariants_hold() {
        // Local entries carry a runtime; cloud entries carry non-zero pricing.
        let snapshot = snapshot_with(vec![
            local_entry("qwen3-4b", true),
            cloud_entry(Provider::Anthropic, "claude-sonnet-4-5"),
        ]);
        for entry in snapshot.list_local() {
            assert!(entry.runtime.is_some());
        }
        for entry in snapshot.list_cloud() {
            assert!(entry.runtime.is_none());
            assert!(entry.pricing.input > 0.0 || entry.pricing.output > 0.0);
        }
    }

    #[test]
    fn staleness_by_ttl_and_load() {
        let mut snapshot = snapshot_with(vec![]);
        assert!(!snapshot.is_stale());

        snapshot.last_scan_at = Some(Utc::now() - chrono::Duration::seconds(301));
        assert!(snapshot.is_stale());

        snapshot.last_scan_at = Some(Utc::now());
        snapshot.refreshed = false; // loaded from disk
        assert!(snapshot.is_stale());
    }

    #[test]
    fn diff_reports_added_removed_updated() {
        let old = snapshot_with(vec![
            local_entry("kept", true),
            local_entry("dropped", true),
            local_entry("flipped", true),
        ]);
        let mut flipped = local_entry("flipped", false);
        flipped.runtime.as_mut().unwrap().reachable = false;
        let new = snapshot_with(vec![
            local_entry("kept", true),
            local_entry("fresh", true),
            flipped,
        ]);

        let change = diff_tables(&old.entries, &new.entries);
        assert_eq!(change.added, vec!["local:fresh"]);
        assert_eq!(change.removed, vec!["local:dropped"]);
        assert_eq!(change.updated, vec!["local:flipped"]);
    }

    #[test]
    fn probe_timestamp_alone_is_not_an_update() {
        let old = local_entry("same", true);
        let mut new = old.clone();
        new.runtime.as_mut().unwrap().last_probed_at =
            Some(Utc::now() + chrono::Duration::seconds(60));
        assert!(!entry_changed(&old, &new));
    }

    #[test]
    fn snapshot_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_registry.json");

        let registry = Registry::new(300, path.clone());
        {
            let mut guard = registry.inner.write().unwrap();
            *guard = Arc::new(snapshot_with(vec![local_entry("qwen3-4b", true)]));
        }
        registry.persist();
        assert!(path.exists());

        let reloaded = Registry::new(300, path);
        let snapshot = reloaded.snapshot_unchecked();
        assert_eq!(snapshot.entries.len(), 1);
        assert!(snapshot.is_stale(), "loaded snapshot must be stale");
    }

    #[test]
    fn largest_context_and_upgrade_candidate() {
        let snapshot = snapshot_with(vec![
            local_entry("small", true),
            cloud_entry(Provider::Anthropic, "claude-sonnet-4-5"),
        ]);
        assert_eq!(snapshot.largest_context(), 200_000);
        let entry = snapshot.entry_with_context(50_000).unwrap();
        assert_eq!(entry.provider, Provider::Anthropic);
        assert!(snapshot.entry_with_context(5_000_000).is_none());
    }
}
