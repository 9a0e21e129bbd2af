use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2025-01-01T00:00:00Z in milliseconds since Unix epoch.
const MESSENGER_EPOCH_MS: u64 = 1_735_689_600_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;

struct Clock {
    last_ms: u64,
    sequence: u64,
}

/// 64-bit, time-ordered message id generator.
///
/// Layout (MSB → LSB): 42 bits of milliseconds since the messenger epoch,
/// 10 bits of worker id, 12 bits of per-millisecond sequence.
///
/// Ids are strictly increasing per generator. If the wall clock steps
/// backwards the generator keeps issuing ids from its last timestamp rather
/// than failing.
pub struct SnowflakeGenerator {
    worker_id: u64,
    clock: Mutex<Clock>,
}

impl SnowflakeGenerator {
    /// Creates a generator. Worker ids above 1023 are masked into range.
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id & MAX_WORKER_ID),
            clock: Mutex::new(Clock {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> i64 {
        let mut clock = match self.clock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now_ms = current_ms().max(clock.last_ms);

        if now_ms == clock.last_ms {
            clock.sequence = (clock.sequence + 1) & SEQUENCE_MASK;
            if clock.sequence == 0 {
                // Sequence exhausted: borrow the next millisecond.
                clock.last_ms += 1;
            }
        } else {
            clock.sequence = 0;
            clock.last_ms = now_ms;
        }

        let ts = clock.last_ms.saturating_sub(MESSENGER_EPOCH_MS);
        let id = (ts << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | clock.sequence;

        id as i64
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(MESSENGER_EPOCH_MS)
}
