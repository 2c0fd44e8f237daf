//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod line;
pub mod memory;
pub mod playback;

pub use buffer::{create_shared_ring, FrameAssembler, FrameRing, JitterReader, JitterRelease, SharedFrameRing};
pub use capture::{CapturePipeline, CaptureState};
pub use device::{input_device_names, output_device_names, CpalBackend};
pub use line::{AudioBackend, InputLine, OutputLine};
pub use memory::{InputScript, MemoryBackend, OutputRecord};
pub use playback::{PlaybackPipeline, PlaybackState};
