pub mod codec;
pub mod record;
pub mod scanner;
pub mod partition;
pub mod stop;
pub mod count;
pub mod container;
pub mod writer;
pub mod repack;

pub use codec::{CodecId, get_codec};
pub use record::{Document, DocumentHeader, Limits, RecordError};
pub use scanner::{Scanner, SeekOptions};
pub use count::{count, CountError, CountOptions};
pub use container::{Container, ContainerOptions};
pub use writer::{AppendWriter, ContainerWriter};
pub use repack::{repack, RepackError, RepackOptions, RepackReport, Topology};
pub use stop::StopSignal;
