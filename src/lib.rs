//! `ext-sample` samples, down-selects and shuffles lines from very large text
//! files into one or more output files, under the constraint that the input
//! may exceed available memory.
//!
//! # Overview
//!
//! `ext-sample` supports the following features:
//!
//! * **Out-of-core operation:**
//!   total line counts are estimated from a sampled prefix, memory budgets
//!   are derived from the discovered physical memory size, and shuffles that
//!   do not fit the budget run as multiple bounded-memory interleaved passes.
//! * **Pluggable high-throughput reading:**
//!   three interchangeable byte-stream strategies (memory-mapped view,
//!   synchronous chunked read, windowed read-ahead) share one consumption
//!   contract, so the choice is a runtime configuration decision.
//! * **Multi-destination routing:**
//!   one pass routes every input line probabilistically to zero, one or
//!   several outputs, each with its own rate, count or "all" target.
//! * **Explicit randomness:**
//!   every sampling function takes the random generator as an argument,
//!   seeded once per run; tests substitute a fixed seed.
//!
//! # Example
//!
//! ```no_run
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! use ext_sample::{InputFile, LineSampler, OutputSpec, SampleTarget, WindowedSource};
//!
//! fn main() {
//!     let input = InputFile::stat("huge.txt".as_ref()).unwrap();
//!     let outputs = vec![OutputSpec::new("sampled.txt", SampleTarget::Rate(0.01))];
//!
//!     let sampler = LineSampler::new(WindowedSource::default());
//!     let mut rng = StdRng::from_entropy();
//!
//!     let written = sampler.sample(&[input], &outputs, &mut rng).unwrap();
//!     println!("{} lines written", written[0]);
//! }
//! ```

pub mod estimate;
pub mod lines;
pub mod output;
pub mod plan;
pub mod sample;
pub mod source;

pub use estimate::{InputFile, LineEstimate};
pub use lines::LineSplitter;
pub use output::{OutputSpec, SampleTarget};
pub use plan::{physical_memory_size, plan_buffer, BufferPlan};
pub use sample::{LineSampler, SampleError};
pub use source::{ByteSource, ChunkedSource, MappedSource, WindowedSource};
