use dashmap::DashMap;
use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::CacheKey;

/// Entrada inmutable del caché.
///
/// Only `last_access` moves after insertion; a refresh inserts a new entry
/// under the same key.
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    size_hint: usize,
    seq: u64,
    last_access: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Prioridad de desalojo: menor = se desaloja antes.
    fn eviction_rank(&self, now: Instant) -> (u8, u64, u64) {
        if self.is_expired(now) {
            (0, self.seq, self.seq)
        } else {
            (1, self.last_access.load(Ordering::Relaxed), self.seq)
        }
    }
}

/// Cache Store: memoización por clave con TTL y capacidad acotada.
///
/// Entries live in a sharded map, so lookups only take a shard read lock and
/// never block each other. Recency is tracked with a logical clock that every
/// insert and hit advances; eviction prefers expired entries, then the least
/// recently used one, then the oldest insertion.
///
/// Capacity is the sum of the size hints of live entries and is reserved
/// atomically before an entry is inserted, so it is never exceeded.
#[derive(Debug)]
pub struct CacheStore<V> {
    entries: DashMap<CacheKey, CacheEntry<V>>,
    capacity: usize,
    used: AtomicUsize,
    clock: AtomicU64,
    counters: Counters,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_removals: AtomicU64,
}

impl<V: Clone> CacheStore<V> {
    pub fn new(capacity: usize) -> Self {
        Self::with_entries(capacity, DashMap::new())
    }

    /// `shards` must be a power of two greater than one.
    pub fn with_shards(capacity: usize, shards: usize) -> Self {
        Self::with_entries(capacity, DashMap::with_shard_amount(shards))
    }

    fn with_entries(capacity: usize, entries: DashMap<CacheKey, CacheEntry<V>>) -> Self {
        Self {
            entries,
            capacity,
            used: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Devuelve el valor si existe y no ha expirado.
    ///
    /// An expired entry counts as absent and is removed on the way out.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!("✅ Cache hit: {}", key);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.remove_if_expired(key, now);
            debug!("⏰ Entrada expirada removida: {}", key);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!("❌ Cache miss: {}", key);
        None
    }

    /// Like [`CacheStore::get`] but leaves counters and recency untouched.
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Inserta o reemplaza la entrada de `key` con `expires_at = now + ttl`.
    ///
    /// Evicts until `size_hint` fits. A value that cannot be fitted is simply
    /// not cached.
    pub fn put(&self, key: CacheKey, value: V, ttl: Duration, size_hint: usize) {
        if size_hint > self.capacity {
            warn!(
                "⚠️ {} ocupa {} bytes, más que la capacidad total ({}); no se cachea",
                key, size_hint, self.capacity
            );
            return;
        }

        // Liberar la entrada anterior para no contarla dos veces
        if let Some((_, old)) = self.entries.remove(&key) {
            self.release(old.size_hint);
        }

        if !self.reserve(size_hint) {
            warn!("⚠️ Sin espacio para {} ({} bytes); no se cachea", key, size_hint);
            return;
        }

        let now = Instant::now();
        let seq = self.tick();
        let entry = CacheEntry {
            value,
            created_at: now,
            expires_at: now + ttl,
            size_hint,
            seq,
            last_access: AtomicU64::new(seq),
        };

        debug!("💾 {} almacenado ({} bytes, ttl {:?})", key, size_hint, ttl);

        // Another put for the same key may have landed since the removal above
        if let Some(replaced) = self.entries.insert(key, entry) {
            self.release(replaced.size_hint);
        }
    }

    /// Elimina la entrada si existe; no-op en caso contrario.
    pub fn invalidate(&self, key: &CacheKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.release(entry.size_hint);
            debug!("🗑️ {} invalidado", key);
        }
    }

    /// Limpia entradas expiradas y retorna el número de elementos removidos
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = expired
            .iter()
            .filter(|key| self.remove_if_expired(key, now))
            .count();

        if removed > 0 {
            debug!("Limpiadas {} entradas expiradas del cache", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Suma de los size hints reservados.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired_removals: self.counters.expired_removals.load(Ordering::Relaxed),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn release(&self, size: usize) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }

    fn remove_if_expired(&self, key: &CacheKey, now: Instant) -> bool {
        match self.entries.remove_if(key, |_, entry| entry.is_expired(now)) {
            Some((_, entry)) => {
                self.release(entry.size_hint);
                self.counters.expired_removals.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Reserva `size` bytes, desalojando víctimas hasta que quepan.
    fn reserve(&self, size: usize) -> bool {
        loop {
            let used = self.used.load(Ordering::Acquire);
            if used + size <= self.capacity {
                if self
                    .used
                    .compare_exchange(used, used + size, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            // The remaining space is held by concurrent reservations
            if !self.evict_one() {
                return false;
            }
        }
    }

    /// Desaloja una víctima. Devuelve `false` si no hay nada que desalojar.
    fn evict_one(&self) -> bool {
        let now = Instant::now();
        let victim = self
            .entries
            .iter()
            .map(|entry| (entry.value().eviction_rank(now), entry.key().clone()))
            .min_by_key(|(rank, _)| *rank);

        let Some(((tier, _, seq), key)) = victim else {
            return false;
        };

        // Only remove the exact entry that was ranked; a replacement keeps its slot
        if let Some((_, entry)) = self.entries.remove_if(&key, |_, entry| entry.seq == seq) {
            self.release(entry.size_hint);
            if tier == 0 {
                self.counters.expired_removals.fetch_add(1, Ordering::Relaxed);
                debug!("⏰ Desalojada entrada expirada: {}", key);
            } else {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "♻️ Desalojada por LRU: {} (edad {:?})",
                    key,
                    now.saturating_duration_since(entry.created_at)
                );
            }
        }
        true
    }
}

/// Métricas básicas del cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_removals: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}
