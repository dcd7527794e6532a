//! # pmostream
//!
//! Small asynchronous byte-stream helpers shared by the transcoding stack.
//!
//! - [`copy_range`]: copy a byte window out of a reader, zero padding when the
//!   source is shorter than the requested length.
//! - [`CountReader`] / [`CountWriter`]: wrap a stream and count the bytes that
//!   flow through it. The counter is readable (and resettable) from any task
//!   through a [`ByteCounter`] handle.
//! - [`TeeReader`]: mirror everything read from a stream into a sink before
//!   handing it to the caller.
//!
//! Every helper is one-shot: once a stream has reached its end it is not
//! restartable.
//!
//! ## Example
//!
//! ```no_run
//! use pmostream::{copy_range, CountWriter};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut input = tokio::fs::File::open("track.ogg").await?;
//!     let mut out = CountWriter::new(tokio::io::stdout());
//!     let counter = out.counter();
//!
//!     copy_range(&mut out, &mut input, 1024, 4096).await?;
//!     assert_eq!(counter.count(), 4096);
//!     Ok(())
//! }
//! ```

mod count;
mod range;
mod tee;

pub use count::{ByteCounter, CountReader, CountWriter};
pub use range::copy_range;
pub use tee::TeeReader;
