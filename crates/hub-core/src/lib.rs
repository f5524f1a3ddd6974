pub mod buffer;
pub mod consumer;
pub mod dispatch;
pub mod gps;
pub mod rapcal;
pub mod sorter;
pub mod stats;
pub mod tcal;
pub mod tree;

pub use buffer::{build_raw, eos_sentinel, BufferError, DaqBuffer, EOS_TIMESTAMP, HEADER_LEN};
pub use consumer::{ChannelConsumer, ConsumerError, NullConsumer, StreamConsumer};
pub use dispatch::{
    HubConsumers, HubDispatch, HubOptions, HitSpoolOptions, RunLevel, SharedRunLevel, StreamKind,
};
pub use gps::{CardGps, FixedGps, GpsInfo, GpsRegistry, GpsSource};
pub use rapcal::{Isochron, RapCal, RapCalError, TcalMeasurement, UtcTranslator};
pub use sorter::{ChannelSorter, SorterError, SorterInput, DEFAULT_QUEUE_BOUND};
pub use stats::{now_ns, SorterSnapshot, SorterStats};
pub use tcal::{TcalProcessor, TcalSnapshot, TcalStats, MAGIC_TCAL_FMTID, UTC_UNDEFINED};
pub use tree::TournamentTree;
