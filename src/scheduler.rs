//! Block scheduler
//!
//! Per (session, common address, interrogation group) a block couples a
//! periodic interrogation cycle with a filtered last-value cache. One
//! session-wide queue drain feeds every block: ASDUs for other common
//! addresses are consumed here and ignored by non-matching blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::asdu::{Asdu, Cause, InformationObject, TypeId};
use crate::config::BlockConfig;
use crate::error::Result;
use crate::session::Iec104Session;

/// Scheduler drain/poll cadence.
const TICK: Duration = Duration::from_millis(50);

/// One cached information object with its delivery context
#[derive(Debug, Clone, PartialEq)]
pub struct CachedObject {
    pub object: InformationObject,
    pub type_id: TypeId,
    pub cause: Cause,
    pub received_at: DateTime<Utc>,
}

/// Last-value cache of one block: IOA to most recent information object.
///
/// Reads are lock-free with respect to each other; writes serialize per
/// entry. Entries are inserted on first receipt, overwritten on every
/// delivery and removed only by [`clear`](BlockCache::clear).
#[derive(Debug, Default)]
pub struct BlockCache {
    map: DashMap<u32, CachedObject>,
}

impl BlockCache {
    pub fn get(&self, ioa: u32) -> Option<CachedObject> {
        self.map.get(&ioa).map(|entry| entry.value().clone())
    }

    /// Every cached object of one type identification, unordered.
    pub fn iter_type(&self, type_id: TypeId) -> Vec<CachedObject> {
        self.map
            .iter()
            .filter(|entry| entry.value().type_id == type_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    fn insert(&self, cached: CachedObject) {
        self.map.insert(cached.object.ioa, cached);
    }
}

/// Interrogation statistics of one block
#[derive(Debug, Default)]
pub struct BlockStats {
    /// Completed cycles (activation termination seen)
    pub cycles: AtomicU64,
    /// Cycles ended by the response timeout
    pub timeouts: AtomicU64,
    /// Objects cached outside interrogation windows
    pub spontaneous: AtomicU64,
}

/// One configured block: filter, cache and interrogation bookkeeping
#[derive(Debug)]
pub struct Block {
    config: BlockConfig,
    cache: BlockCache,
    stats: BlockStats,
    last_cycle: Mutex<Option<Instant>>,
    /// Set while a cycle is collecting, so ingested objects are not counted
    /// as spontaneous
    interrogating: std::sync::atomic::AtomicBool,
}

impl Block {
    pub fn new(config: BlockConfig) -> Self {
        Self {
            config,
            cache: BlockCache::default(),
            stats: BlockStats::default(),
            last_cycle: Mutex::new(None),
            interrogating: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn stats(&self) -> &BlockStats {
        &self.stats
    }

    /// Whether this block covers an address pair.
    pub fn covers(&self, common_addr: u16, ioa: u32) -> bool {
        self.config.enabled
            && self.config.common_addr == common_addr
            && ioa >= self.config.ioa_from
            && ioa <= self.config.ioa_to
    }

    /// Apply the IOA/TypeID filters and update the cache. Objects whose
    /// quality is invalid still update it: the flag is part of the value.
    fn ingest(&self, asdu: &Asdu) -> usize {
        if !self.config.enabled || asdu.common_addr != self.config.common_addr {
            return 0;
        }
        if !asdu.type_id.is_monitoring() {
            return 0;
        }

        let received_at = Utc::now();
        let mut cached = 0;
        for object in &asdu.objects {
            if !self.config.retains(object.ioa, asdu.type_id.to_byte()) {
                continue;
            }
            self.cache.insert(CachedObject {
                object: object.clone(),
                type_id: asdu.type_id,
                cause: asdu.cot.cause,
                received_at,
            });
            cached += 1;
        }
        if cached > 0 && !self.interrogating.load(Ordering::Relaxed) {
            self.stats.spontaneous.fetch_add(cached as u64, Ordering::Relaxed);
        }
        cached as usize
    }

    fn due(&self, now: Instant) -> bool {
        if !self.config.enabled {
            return false;
        }
        match *self.last_cycle.lock() {
            None => true,
            Some(last) => now.duration_since(last) >= self.config.period(),
        }
    }

    fn mark_cycle(&self, now: Instant) {
        *self.last_cycle.lock() = Some(now);
    }
}

/// Drives all blocks of one session: spontaneous ingest plus periodic
/// interrogation cycles
pub struct BlockScheduler {
    session: Arc<Iec104Session>,
    blocks: Vec<Arc<Block>>,
}

impl BlockScheduler {
    pub fn new(session: Arc<Iec104Session>, configs: Vec<BlockConfig>) -> Self {
        let blocks = configs
            .into_iter()
            .map(|config| Arc::new(Block::new(config)))
            .collect();
        Self { session, blocks }
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    /// The enabled block covering an address pair, if any.
    pub fn block_covering(&self, common_addr: u16, ioa: u32) -> Option<Arc<Block>> {
        self.blocks
            .iter()
            .find(|b| b.covers(common_addr, ioa))
            .cloned()
    }

    /// Drain the session queue once and feed every block.
    pub fn ingest_pending(&self) -> usize {
        let mut total = 0;
        for asdu in self.session.dequeue_received_asdus() {
            for block in &self.blocks {
                total += block.ingest(&asdu);
            }
        }
        total
    }

    /// Run one interrogation cycle for a block: activate, collect until the
    /// activation termination for this common address (or the response
    /// timeout), ingesting everything that arrives meanwhile.
    pub async fn run_interrogation(&self, block: &Block) -> Result<()> {
        let common_addr = block.config.common_addr;
        let qoi = block.config.qoi;

        block.interrogating.store(true, Ordering::Relaxed);
        let result = self.collect_cycle(block, common_addr, qoi).await;
        block.interrogating.store(false, Ordering::Relaxed);
        block.mark_cycle(Instant::now());
        result
    }

    async fn collect_cycle(&self, block: &Block, common_addr: u16, qoi: u8) -> Result<()> {
        self.session.send_interrogation(common_addr, qoi).await?;
        debug!(
            session = %self.session.name(),
            event_kind = "interrogation_started",
            detail = %format!("ca={common_addr} qoi={qoi}"),
            "interrogation cycle started"
        );

        let deadline = Instant::now() + block.config.response_timeout();
        loop {
            let mut terminated = false;
            for asdu in self.session.dequeue_received_asdus() {
                if is_activation_termination(&asdu, common_addr) {
                    terminated = true;
                }
                for candidate in &self.blocks {
                    candidate.ingest(&asdu);
                }
            }

            if terminated {
                block.stats.cycles.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session = %self.session.name(),
                    event_kind = "interrogation_complete",
                    detail = %format!("ca={common_addr} cached={}", block.cache.len()),
                    "interrogation cycle complete"
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                block.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session = %self.session.name(),
                    event_kind = "interrogation_timeout",
                    detail = %format!("ca={common_addr} qoi={qoi}"),
                    "no activation termination before the response timeout"
                );
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Scheduler task body: spontaneous ingest continuously, interrogation
    /// cycles when due and the session is active. Runs until aborted.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.ingest_pending();

            if self.session.is_active() {
                let now = Instant::now();
                for block in &self.blocks {
                    if block.due(now) {
                        // errors here are session-level; the supervisor owns
                        // reconnection, the cycle simply retries next period
                        if let Err(e) = self.run_interrogation(block).await {
                            warn!(
                                session = %self.session.name(),
                                event_kind = %e.kind(),
                                detail = %e,
                                "interrogation failed"
                            );
                        }
                    }
                }
            }

            tokio::time::sleep(TICK).await;
        }
    }

    /// Spawn the scheduler loop; abort the handle to stop it.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// TypeID 100 with COT activation termination for the matching common
/// address ends a collect window.
fn is_activation_termination(asdu: &Asdu, common_addr: u16) -> bool {
    asdu.type_id == TypeId::InterrogationCommand
        && asdu.cot.cause == Cause::ActivationTerm
        && asdu.common_addr == common_addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::{QualityDescriptor, Value};
    use pretty_assertions::assert_eq;

    fn block() -> Block {
        Block::new(BlockConfig::parse("1-20-1-1000/1,9,13/true").unwrap())
    }

    fn measurement(ca: u16, ioa: u32, value: f32) -> Asdu {
        Asdu::new(
            TypeId::MeasuredFloat,
            Cause::Spontaneous,
            ca,
            vec![InformationObject::new(ioa, Value::Float(value))],
        )
    }

    #[test]
    fn ingest_applies_filters() {
        let block = block();

        assert_eq!(block.ingest(&measurement(1, 100, 1.0)), 1);
        // wrong common address
        assert_eq!(block.ingest(&measurement(2, 100, 1.0)), 0);
        // IOA outside the retained range
        assert_eq!(block.ingest(&measurement(1, 1001, 1.0)), 0);
        // type not in the filter set
        let scaled = Asdu::new(
            TypeId::MeasuredScaled,
            Cause::Spontaneous,
            1,
            vec![InformationObject::new(50, Value::Scaled(7))],
        );
        assert_eq!(block.ingest(&scaled), 0);

        assert_eq!(block.cache().len(), 1);
        assert_eq!(
            block.cache().get(100).unwrap().object.value,
            Value::Float(1.0)
        );
    }

    #[test]
    fn cache_overwrites_and_is_idempotent() {
        let block = block();
        block.ingest(&measurement(1, 100, 1.0));
        block.ingest(&measurement(1, 100, 2.0));
        assert_eq!(block.cache().len(), 1);
        assert_eq!(
            block.cache().get(100).unwrap().object.value,
            Value::Float(2.0)
        );

        // writing the identical object twice yields identical reads
        block.ingest(&measurement(1, 100, 2.0));
        let first = block.cache().get(100).unwrap();
        block.ingest(&measurement(1, 100, 2.0));
        let second = block.cache().get(100).unwrap();
        assert_eq!(first.object, second.object);
    }

    #[test]
    fn invalid_quality_still_updates_cache() {
        let block = block();
        block.ingest(&measurement(1, 100, 1.0));

        let invalid = Asdu::new(
            TypeId::MeasuredFloat,
            Cause::Spontaneous,
            1,
            vec![InformationObject::new(100, Value::Float(9.0))
                .with_quality(QualityDescriptor::invalid_quality())],
        );
        block.ingest(&invalid);

        let cached = block.cache().get(100).unwrap();
        assert_eq!(cached.object.value, Value::Float(9.0));
        assert!(cached.object.quality.invalid);
    }

    #[test]
    fn command_confirmations_are_not_cached() {
        let block = block();
        let actcon = Asdu::new(
            TypeId::InterrogationCommand,
            Cause::ActivationCon,
            1,
            vec![InformationObject::new(0, Value::Qualifier(20))],
        );
        assert_eq!(block.ingest(&actcon), 0);
        assert!(block.cache().is_empty());
    }

    #[test]
    fn iter_type_filters() {
        let block = block();
        block.ingest(&measurement(1, 100, 1.0));
        block.ingest(&measurement(1, 101, 2.0));
        let singles = Asdu::new(
            TypeId::SinglePoint,
            Cause::Spontaneous,
            1,
            vec![InformationObject::new(200, Value::Bool(true))],
        );
        block.ingest(&singles);

        assert_eq!(block.cache().iter_type(TypeId::MeasuredFloat).len(), 2);
        assert_eq!(block.cache().iter_type(TypeId::SinglePoint).len(), 1);
        assert_eq!(block.cache().iter_type(TypeId::MeasuredScaled).len(), 0);

        block.cache().clear();
        assert!(block.cache().is_empty());
    }

    #[test]
    fn disabled_block_ignores_everything() {
        let block = Block::new(BlockConfig::parse("1-20-1-1000//false").unwrap());
        assert_eq!(block.ingest(&measurement(1, 100, 1.0)), 0);
        assert!(!block.due(Instant::now()));
        assert!(!block.covers(1, 100));
    }

    #[test]
    fn due_respects_period() {
        let block = block();
        let now = Instant::now();
        assert!(block.due(now));
        block.mark_cycle(now);
        assert!(!block.due(now + Duration::from_millis(10)));
        assert!(block.due(now + block.config().period()));
    }

    #[test]
    fn termination_detection_matches_ca() {
        let term = Asdu::new(
            TypeId::InterrogationCommand,
            Cause::ActivationTerm,
            1,
            vec![InformationObject::new(0, Value::Qualifier(20))],
        );
        assert!(is_activation_termination(&term, 1));
        assert!(!is_activation_termination(&term, 2));

        let con = Asdu::new(
            TypeId::InterrogationCommand,
            Cause::ActivationCon,
            1,
            vec![InformationObject::new(0, Value::Qualifier(20))],
        );
        assert!(!is_activation_termination(&con, 1));
    }
}
