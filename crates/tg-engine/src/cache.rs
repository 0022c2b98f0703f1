// cache.rs — CacheLayer: exact memo + normalized-pattern cache.
//
// Two tiers, both bounded LRU maps with lazy TTL expiry:
//
//   memo     keyed by the whole operation minus its timestamp. Serves
//            identical repeats.
//   pattern  keyed by a Fingerprint: operation type, MCP target, environment,
//            and the command tokens with volatile arguments (paths, numbers,
//            revisions, long text) replaced by class placeholders. Serves
//            "same shape, different file" repeats. Only entries at or above
//            the configured confidence are served.
//
// A token that appears in any policy pattern is never generalized, so two
// operations share a fingerprint only when every check the classifier runs
// sees the same text. A pattern hit is re-explained for the operation it is
// served to.
//
// Only raw classifier verdicts are cached. Guard vetoes, rate limits, and
// manual-mode downgrades are applied on every evaluation, outside the cache.
//
// `reset(policy)` installs a new KeySpace (generation + policy + literal
// tokens) and clears both tiers. Callers capture the generation before
// classifying and pass it back on insert; a result computed under an older
// policy is silently discarded.
//
// A history of recent misses feeds `precompute()`, which classifies
// fingerprints seen at least `threshold` times and inserts them ahead of
// demand.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use tg_policy::{
    pattern_tokens, Classification, DecisionSource, Operation, OperationClassifier,
    OperationContext, OperationType, Policy, TrustDecision,
};

/// Confidence of a live classification whose fingerprint has no placeholders.
const EXACT_SHAPE_CONFIDENCE: f64 = 1.0;
/// Confidence of a live classification generalized over placeholders.
const GENERALIZED_CONFIDENCE: f64 = 0.85;
/// Confidence of a precomputed entry.
const PRECOMPUTED_CONFIDENCE: f64 = 0.9;

/// Shape of an operation, used as the pattern-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of `op`. Tokens in `literals` (lowercase) keep their text.
    pub fn of(op: &Operation, literals: &HashSet<String>) -> Self {
        let op_type = op.effective_type();
        let mut parts = vec![op_type.to_string()];
        if let Some(key) = op.mcp_key() {
            parts.push(key);
        }
        if let Some(env) = op.context.environment.as_deref() {
            parts.push(format!("env={}", env.to_lowercase()));
        }
        if op_type == OperationType::Script {
            // Allowed-path checks depend on where the script is run from.
            parts.push(format!("wd={}", op.context.working_directory));
        }

        let command_tokens = op.command.split_whitespace().count();
        for (i, token) in op.raw_tokens().into_iter().enumerate() {
            let lower = token.to_lowercase();
            if token.starts_with('-') || op_type == OperationType::Script {
                // Flags keep their case: -D and -d classify differently.
                // Script paths are matched case-sensitively.
                parts.push(token.to_string());
            } else if i < command_tokens || literals.contains(&lower) {
                parts.push(lower);
            } else {
                parts.push(token_class(token).unwrap_or(lower));
            }
        }
        Fingerprint(parts.join(" "))
    }

    /// True when at least one argument was replaced by a placeholder.
    pub fn is_generalized(&self) -> bool {
        self.0.split(' ').any(|t| t.starts_with('<') && t.ends_with('>'))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn token_class(token: &str) -> Option<String> {
    if token.contains("..") {
        // Traversal segments are never generalized.
        return None;
    }
    let class = if token.chars().count() > 64 {
        "<text>"
    } else if token.chars().all(|c| c.is_ascii_digit()) {
        "<num>"
    } else if (7..=40).contains(&token.len())
        && token.chars().all(|c| c.is_ascii_hexdigit())
        && token.chars().any(|c| c.is_ascii_digit())
    {
        "<rev>"
    } else if token.contains('/') || looks_like_file(token) {
        "<path>"
    } else {
        return None;
    };
    Some(class.to_string())
}

fn looks_like_file(token: &str) -> bool {
    match token.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Exact-memo key: everything but the timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MemoKey {
    op_type: OperationType,
    command: String,
    args: Vec<String>,
    context: OperationContext,
}

impl MemoKey {
    fn of(op: &Operation) -> Self {
        Self {
            op_type: op.op_type,
            command: op.command.clone(),
            args: op.args.clone(),
            context: op.context.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    verdict: Classification,
    confidence: f64,
    created_at: Instant,
    ttl: Duration,
    generation: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Bounded map evicting the least recently used key.
struct Lru<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
}

impl<K: Hash + Eq + Clone, V> Lru<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        let (_, used) = self.entries.get_mut(key)?;
        self.order.remove(used);
        *used = tick;
        self.order.insert(tick, key.clone());
        self.entries.get(key).map(|(v, _)| v)
    }

    fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(v, _)| v)
    }

    /// Returns how many entries were evicted.
    fn insert(&mut self, key: K, value: V) -> usize {
        let tick = self.next_tick();
        if let Some((_, old)) = self.entries.insert(key.clone(), (value, tick)) {
            self.order.remove(&old);
        }
        self.order.insert(tick, key);

        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    fn remove(&mut self, key: &K) {
        if let Some((_, used)) = self.entries.remove(key) {
            self.order.remove(&used);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Counters for `stats()`.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub memo_hits: u64,
    pub pattern_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub precomputed: u64,
    pub memo_size: usize,
    pub pattern_size: usize,
    pub generation: u64,
}

#[derive(Default)]
struct Counters {
    memo_hits: AtomicU64,
    pattern_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    precomputed: AtomicU64,
}

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub memo_capacity: usize,
    pub pattern_capacity: usize,
    pub ttl: Duration,
    pub min_confidence: f64,
    pub precompute_threshold: usize,
    pub history_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memo_capacity: 1000,
            pattern_capacity: 5000,
            ttl: Duration::from_secs(300),
            min_confidence: 0.8,
            precompute_threshold: 5,
            history_size: 1000,
        }
    }
}

/// Everything a fingerprint and its verdict depend on, swapped as one.
struct KeySpace {
    generation: u64,
    policy: Arc<Policy>,
    literals: HashSet<String>,
}

impl KeySpace {
    fn new(generation: u64, policy: Arc<Policy>) -> Self {
        Self {
            generation,
            literals: pattern_tokens(&policy),
            policy,
        }
    }
}

pub struct CacheLayer {
    settings: CacheSettings,
    keys: RwLock<Arc<KeySpace>>,
    memo: Mutex<Lru<MemoKey, CacheEntry>>,
    patterns: Mutex<Lru<Fingerprint, CacheEntry>>,
    history: Mutex<VecDeque<Operation>>,
    counters: Counters,
}

impl CacheLayer {
    pub fn new(settings: CacheSettings, policy: Arc<Policy>) -> Self {
        Self {
            memo: Mutex::new(Lru::new(settings.memo_capacity)),
            patterns: Mutex::new(Lru::new(settings.pattern_capacity)),
            history: Mutex::new(VecDeque::new()),
            keys: RwLock::new(Arc::new(KeySpace::new(0, policy))),
            counters: Counters::default(),
            settings,
        }
    }

    fn keys(&self) -> Arc<KeySpace> {
        Arc::clone(&self.keys.read())
    }

    /// Current generation; capture before classifying, pass to `store()`.
    pub fn generation(&self) -> u64 {
        self.keys.read().generation
    }

    /// Fingerprint of `op` under the current policy.
    pub fn fingerprint(&self, op: &Operation) -> Fingerprint {
        Fingerprint::of(op, &self.keys().literals)
    }

    /// Memo first, then pattern cache. Records the miss for precomputation.
    pub fn lookup(&self, op: &Operation) -> Option<TrustDecision> {
        let now = Instant::now();
        let keys = self.keys();

        let memo_key = MemoKey::of(op);
        if let Some(verdict) = self.lookup_in(&self.memo, &memo_key, now, keys.generation, 0.0) {
            self.counters.memo_hits.fetch_add(1, Ordering::Relaxed);
            return Some(verdict.into_decision().with_source(DecisionSource::Memo));
        }

        let fingerprint = Fingerprint::of(op, &keys.literals);
        if let Some(verdict) = self.lookup_in(
            &self.patterns,
            &fingerprint,
            now,
            keys.generation,
            self.settings.min_confidence,
        ) {
            self.counters.pattern_hits.fetch_add(1, Ordering::Relaxed);
            return Some(
                verdict
                    .explained_for(op)
                    .into_decision()
                    .with_source(DecisionSource::PatternCache),
            );
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock();
        history.push_back(op.clone());
        while history.len() > self.settings.history_size.max(1) {
            history.pop_front();
        }
        None
    }

    fn lookup_in<K: Hash + Eq + Clone>(
        &self,
        map: &Mutex<Lru<K, CacheEntry>>,
        key: &K,
        now: Instant,
        generation: u64,
        min_confidence: f64,
    ) -> Option<Classification> {
        let mut map = map.lock();
        let entry = map.get(key)?;
        if entry.generation != generation || entry.is_expired(now) {
            map.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if entry.confidence < min_confidence {
            return None;
        }
        Some(entry.verdict.clone())
    }

    /// Store a fresh classifier verdict computed under `generation`.
    ///
    /// Returns false when the generation is stale and nothing was stored.
    pub fn store(&self, op: &Operation, verdict: &Classification, generation: u64) -> bool {
        let keys = self.keys();
        if keys.generation != generation {
            return false;
        }
        let fingerprint = Fingerprint::of(op, &keys.literals);
        let confidence = if fingerprint.is_generalized() {
            GENERALIZED_CONFIDENCE
        } else {
            EXACT_SHAPE_CONFIDENCE
        };

        {
            let mut memo = self.memo.lock();
            if generation != self.generation() {
                return false;
            }
            let evicted = memo.insert(MemoKey::of(op), self.entry(verdict, 1.0, generation));
            self.counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        self.store_pattern(fingerprint, verdict, confidence, generation)
    }

    fn store_pattern(
        &self,
        fingerprint: Fingerprint,
        verdict: &Classification,
        confidence: f64,
        generation: u64,
    ) -> bool {
        let mut patterns = self.patterns.lock();
        if generation != self.generation() {
            return false;
        }
        let evicted = patterns.insert(fingerprint, self.entry(verdict, confidence, generation));
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        true
    }

    fn entry(&self, verdict: &Classification, confidence: f64, generation: u64) -> CacheEntry {
        CacheEntry {
            verdict: verdict.clone(),
            confidence,
            created_at: Instant::now(),
            ttl: self.settings.ttl,
            generation,
        }
    }

    /// Key everything by `policy` from now on. Drops both tiers and bumps
    /// the generation.
    pub fn reset(&self, policy: Arc<Policy>) {
        let generation = {
            let mut keys = self.keys.write();
            let generation = keys.generation + 1;
            *keys = Arc::new(KeySpace::new(generation, policy));
            generation
        };
        self.memo.lock().clear();
        self.patterns.lock().clear();
        self.history.lock().clear();
        tracing::info!(generation, "decision caches invalidated");
    }

    /// Classify frequent recent fingerprints that are not cached yet, under
    /// the policy the cache is keyed by.
    ///
    /// Returns how many entries were inserted.
    pub fn precompute(&self, classifier: &OperationClassifier) -> usize {
        let keys = self.keys();
        let generation = keys.generation;

        let candidates: Vec<(Fingerprint, Operation)> = {
            let history = self.history.lock();
            let mut counts: HashMap<Fingerprint, (usize, &Operation)> = HashMap::new();
            for op in history.iter() {
                let slot = counts
                    .entry(Fingerprint::of(op, &keys.literals))
                    .or_insert((0, op));
                slot.0 += 1;
                slot.1 = op;
            }
            counts
                .into_iter()
                .filter(|(_, (n, _))| *n >= self.settings.precompute_threshold)
                .map(|(fp, (_, op))| (fp, op.clone()))
                .collect()
        };

        let mut inserted = 0;
        for (fingerprint, op) in candidates {
            let cached = self
                .patterns
                .lock()
                .peek(&fingerprint)
                .is_some_and(|e| e.generation == generation && !e.is_expired(Instant::now()));
            if cached {
                continue;
            }
            let verdict = classifier.classify(&op, &keys.policy);
            if self.store_pattern(fingerprint, &verdict, PRECOMPUTED_CONFIDENCE, generation) {
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.counters
                .precomputed
                .fetch_add(inserted as u64, Ordering::Relaxed);
            tracing::debug!(inserted, "precomputed frequent patterns");
        }
        inserted
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memo_hits: self.counters.memo_hits.load(Ordering::Relaxed),
            pattern_hits: self.counters.pattern_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            precomputed: self.counters.precomputed.load(Ordering::Relaxed),
            memo_size: self.memo.lock().len(),
            pattern_size: self.patterns.lock().len(),
            generation: self.generation(),
        }
    }
}
