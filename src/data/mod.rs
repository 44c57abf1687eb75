pub mod dataset;
pub mod edf;
pub mod filter;
pub mod loader;
pub mod recording;

pub use dataset::{Dataset, Dn3Dataset, Sfreq, Thinker, Trial};
pub use loader::{Batch, DataLoader};
pub use recording::{ProcessedSignal, Recording, SequenceLength, SignalPipeline, Windowing};
