pub mod demuxer;
pub mod frame;
pub mod source;

pub use demuxer::FrameDemuxer;
pub use frame::{encode_jpeg, encode_png, DecodedFrame, RawFrame};
pub use source::{ProcessGuard, ReplaySource, SourceError, StreamlinkSource, TimeRange, VideoSource};
