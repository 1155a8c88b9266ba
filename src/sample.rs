//! Line sampling and shuffling engine.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use log;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::estimate::InputFile;
use crate::lines::LineSplitter;
use crate::output::OutputSpec;
use crate::plan::BufferPlan;
use crate::source::ByteSource;

/// Sampling error.
#[derive(Debug)]
pub enum SampleError {
    /// Input file open/read failure.
    Input { path: PathBuf, source: io::Error },
    /// Output file create/write failure.
    Output { path: PathBuf, source: io::Error },
    /// An output reached the engine with a target the mode cannot consume.
    UnresolvedTarget { path: PathBuf },
}

impl Error for SampleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SampleError::Input { source, .. } => Some(source),
            SampleError::Output { source, .. } => Some(source),
            SampleError::UnresolvedTarget { .. } => None,
        }
    }
}

impl Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleError::Input { path, source } => {
                write!(f, "reading {} failed: {}", path.display(), source)
            }
            SampleError::Output { path, source } => {
                write!(f, "writing {} failed: {}", path.display(), source)
            }
            SampleError::UnresolvedTarget { path } => {
                write!(f, "output {} has no resolved sampling target", path.display())
            }
        }
    }
}

/// Line sampling and shuffling engine over a byte-stream source.
///
/// The engine pulls bytes from the source, slices them into lines and routes
/// each line probabilistically to zero, one or several outputs. Control flow
/// is single threaded; the only concurrency lives inside the source.
pub struct LineSampler<S: ByteSource> {
    source: S,
}

impl<S: ByteSource> LineSampler<S> {
    pub fn new(source: S) -> Self {
        LineSampler { source }
    }

    /// Simple mode: one linear scan of all inputs in file order, applying an
    /// independent Bernoulli trial per line per output. A rate of 1.0 copies
    /// unconditionally. Constant-size memory; any mix of inputs and outputs.
    ///
    /// Returns the number of lines written per output, in spec order.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        inputs: &[InputFile],
        outputs: &[OutputSpec],
        rng: &mut R,
    ) -> Result<Vec<u64>, SampleError> {
        let mut lanes = open_lanes(outputs)?;

        if lanes.len() == 1 {
            log::debug!("one output without a count target, using the streamlined pass");
            for input in inputs {
                log::info!("sampling {}", input.path.display());
                let lane = &mut lanes[0];
                self.scan_lines(input, |line| {
                    if lane.rate >= 1.0 || rng.gen::<f64>() < lane.rate {
                        lane.write(line)?;
                    }
                    Ok(())
                })?;
            }
        } else {
            for input in inputs {
                log::info!("sampling {}", input.path.display());
                self.scan_lines(input, |line| deliver(&mut lanes, line, rng))?;
            }
        }

        return finish_lanes(lanes);
    }

    /// Shuffle mode: randomized output ordering, not just selection.
    ///
    /// With an interleaving factor of 1 every line is loaded, permuted
    /// uniformly at random and sampled into the outputs. With a factor of
    /// K > 1 the line position space is partitioned into K buckets by
    /// position modulo K and each bucket is staged, shuffled and written in
    /// its own pass, so no more than one bucket's data is ever materialized.
    pub fn shuffle<R: Rng + ?Sized>(
        &self,
        inputs: &[InputFile],
        outputs: &[OutputSpec],
        plan: BufferPlan,
        rng: &mut R,
    ) -> Result<Vec<u64>, SampleError> {
        if plan.interleave > 1 {
            return self.shuffle_interleaved(inputs, outputs, plan, rng);
        }

        let mut lanes = open_lanes(outputs)?;
        let mut stage: Vec<Vec<u8>> = Vec::new();

        for input in inputs {
            log::info!("loading {}", input.path.display());
            self.scan_lines(input, |line| {
                stage.push(own_line(line));
                Ok(())
            })?;
        }

        log::debug!("shuffling {} lines in a single pass", stage.len());
        stage.shuffle(rng);
        write_stage(&stage, &mut lanes, rng)?;

        return finish_lanes(lanes);
    }

    fn shuffle_interleaved<R: Rng + ?Sized>(
        &self,
        inputs: &[InputFile],
        outputs: &[OutputSpec],
        plan: BufferPlan,
        rng: &mut R,
    ) -> Result<Vec<u64>, SampleError> {
        let factor = plan.interleave;
        let mut lanes = open_lanes(outputs)?;

        for bucket in 0..factor {
            let mut stage: Vec<Vec<u8>> = Vec::new();
            let mut staged_bytes = 0u64;
            // global line position, consistent across passes
            let mut position = 0u64;

            for input in inputs {
                self.scan_lines(input, |line| {
                    if position % factor == bucket {
                        staged_bytes += line.len() as u64;
                        stage.push(own_line(line));
                    }
                    position += 1;
                    Ok(())
                })?;
            }

            if plan.budget > 0 && staged_bytes > plan.budget {
                log::warn!(
                    "pass {} staged {} bytes, over the {} byte budget",
                    bucket + 1,
                    staged_bytes,
                    plan.budget
                );
            }
            log::debug!("pass {}/{}: shuffling {} lines", bucket + 1, factor, stage.len());

            stage.shuffle(rng);
            write_stage(&stage, &mut lanes, rng)?;
            // the stage is released before the next bucket begins
        }

        return finish_lanes(lanes);
    }

    /// Quick mode: a single pass over one input, filling a fast reservoir of
    /// the target size per output. Selection is approximate and the
    /// reservoir's replacement order doubles as the output shuffle. Every
    /// output must carry an absolute count target.
    pub fn quick_sample<R: Rng + ?Sized>(
        &self,
        input: &InputFile,
        outputs: &[OutputSpec],
        rng: &mut R,
    ) -> Result<Vec<u64>, SampleError> {
        let mut reservoirs = outputs
            .iter()
            .map(|spec| match spec.target.count() {
                Some(count) => Ok(Reservoir::new(spec.path.clone(), count as usize)),
                None => Err(SampleError::UnresolvedTarget {
                    path: spec.path.clone(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::info!("quick-sampling {}", input.path.display());
        self.scan_lines(input, |line| {
            for reservoir in reservoirs.iter_mut() {
                reservoir.offer(line, rng);
            }
            Ok(())
        })?;

        let mut written = Vec::with_capacity(reservoirs.len());
        for reservoir in reservoirs {
            written.push(reservoir.finish()?);
        }

        return Ok(written);
    }

    /// Streams one input and invokes `per_line` for every line, including an
    /// unterminated final one. The first error aborts the scan; a source
    /// error is reported against the input path, a `per_line` error as-is.
    fn scan_lines<F>(&self, input: &InputFile, mut per_line: F) -> Result<(), SampleError>
    where
        F: FnMut(&[u8]) -> Result<(), SampleError>,
    {
        let mut splitter = LineSplitter::new();
        let mut failed: Option<SampleError> = None;

        let streamed = self.source.stream(&input.path, &mut |chunk| {
            splitter.feed(chunk, &mut |line| {
                per_line(line).map_err(|err| stash(&mut failed, err))
            })
        });
        take_failure(&mut failed)?;
        streamed.map_err(|err| input_error(&input.path, err))?;

        let finished = splitter.finish(&mut |line| {
            per_line(line).map_err(|err| stash(&mut failed, err))
        });
        take_failure(&mut failed)?;
        finished.map_err(|err| input_error(&input.path, err))?;

        return Ok(());
    }
}

/// One open output file with its resolved sampling rate.
struct OutputLane {
    path: PathBuf,
    rate: f64,
    written: u64,
    writer: io::BufWriter<fs::File>,
}

impl OutputLane {
    fn write(&mut self, line: &[u8]) -> Result<(), SampleError> {
        self.writer.write_all(line).map_err(|err| SampleError::Output {
            path: self.path.clone(),
            source: err,
        })?;
        self.written += 1;
        return Ok(());
    }
}

fn open_lanes(outputs: &[OutputSpec]) -> Result<Vec<OutputLane>, SampleError> {
    let mut lanes = Vec::with_capacity(outputs.len());
    for spec in outputs {
        let rate = spec.target.rate().ok_or_else(|| SampleError::UnresolvedTarget {
            path: spec.path.clone(),
        })?;
        let file = fs::File::create(&spec.path).map_err(|err| SampleError::Output {
            path: spec.path.clone(),
            source: err,
        })?;
        lanes.push(OutputLane {
            path: spec.path.clone(),
            rate,
            written: 0,
            writer: io::BufWriter::new(file),
        });
    }
    return Ok(lanes);
}

/// Routes one line through every lane's independent Bernoulli trial.
fn deliver<R: Rng + ?Sized>(
    lanes: &mut [OutputLane],
    line: &[u8],
    rng: &mut R,
) -> Result<(), SampleError> {
    for lane in lanes.iter_mut() {
        if lane.rate >= 1.0 || rng.gen::<f64>() < lane.rate {
            lane.write(line)?;
        }
    }
    return Ok(());
}

/// Samples a shuffled stage into every lane.
fn write_stage<R: Rng + ?Sized>(
    stage: &[Vec<u8>],
    lanes: &mut [OutputLane],
    rng: &mut R,
) -> Result<(), SampleError> {
    for lane in lanes.iter_mut() {
        for line in stage {
            if lane.rate >= 1.0 || rng.gen::<f64>() < lane.rate {
                lane.write(line)?;
            }
        }
    }
    return Ok(());
}

fn finish_lanes(mut lanes: Vec<OutputLane>) -> Result<Vec<u64>, SampleError> {
    let mut written = Vec::with_capacity(lanes.len());
    for lane in lanes.iter_mut() {
        lane.writer.flush().map_err(|err| SampleError::Output {
            path: lane.path.clone(),
            source: err,
        })?;
        log::info!("{}: {} lines written", lane.path.display(), lane.written);
        written.push(lane.written);
    }
    return Ok(written);
}

/// Owns a line for staging, terminating it so reordered output stays
/// line-structured even when the stream tail had no terminator.
fn own_line(line: &[u8]) -> Vec<u8> {
    let mut owned = line.to_vec();
    if !owned.ends_with(b"\n") {
        owned.push(b'\n');
    }
    return owned;
}

fn stash(slot: &mut Option<SampleError>, err: SampleError) -> io::Error {
    *slot = Some(err);
    io::Error::new(io::ErrorKind::Other, "sampling aborted")
}

fn take_failure(slot: &mut Option<SampleError>) -> Result<(), SampleError> {
    match slot.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn input_error(path: &Path, source: io::Error) -> SampleError {
    SampleError::Input {
        path: path.to_path_buf(),
        source,
    }
}

/// Fixed-size reservoir with skip-based replacement (Li's algorithm): once
/// full, the number of lines to pass over is drawn directly instead of
/// rolling a trial per line.
struct Reservoir {
    path: PathBuf,
    target: usize,
    lines: Vec<Vec<u8>>,
    w: f64,
    skip: u64,
}

impl Reservoir {
    fn new(path: PathBuf, target: usize) -> Self {
        Reservoir {
            path,
            target,
            lines: Vec::with_capacity(target),
            w: 1.0,
            skip: 0,
        }
    }

    fn offer<R: Rng + ?Sized>(&mut self, line: &[u8], rng: &mut R) {
        if self.target == 0 {
            return;
        }

        if self.lines.len() < self.target {
            self.lines.push(own_line(line));
            if self.lines.len() == self.target {
                self.advance(rng);
            }
            return;
        }

        if self.skip > 0 {
            self.skip -= 1;
            return;
        }

        let slot = rng.gen_range(0..self.target);
        self.lines[slot] = own_line(line);
        self.advance(rng);
    }

    /// Draws the next skip length.
    fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let k = self.target as f64;
        self.w *= (draw(rng).ln() / k).exp();
        self.skip = (draw(rng).ln() / (1.0 - self.w).ln()).floor() as u64;
    }

    fn finish(self) -> Result<u64, SampleError> {
        let file = fs::File::create(&self.path).map_err(|err| SampleError::Output {
            path: self.path.clone(),
            source: err,
        })?;
        let mut writer = io::BufWriter::new(file);

        for line in &self.lines {
            writer.write_all(line).map_err(|err| SampleError::Output {
                path: self.path.clone(),
                source: err,
            })?;
        }
        writer.flush().map_err(|err| SampleError::Output {
            path: self.path.clone(),
            source: err,
        })?;

        log::info!("{}: {} lines written", self.path.display(), self.lines.len());
        return Ok(self.lines.len() as u64);
    }
}

/// Uniform draw on (0, 1]; ln of the result is always finite.
fn draw<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    1.0 - rng.gen::<f64>()
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::path::PathBuf;

    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::*;

    use crate::output::{OutputSpec, SampleTarget};
    use crate::plan::BufferPlan;
    use crate::source::ChunkedSource;

    use super::{InputFile, LineSampler, SampleError};

    fn sampler() -> LineSampler<ChunkedSource> {
        // small chunks exercise lines spanning chunk boundaries
        LineSampler::new(ChunkedSource::new(64))
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    fn write_input(dir: &tempfile::TempDir, name: &str, count: usize) -> InputFile {
        let path = dir.path().join(name);
        let mut data = Vec::new();
        for index in 0..count {
            data.extend_from_slice(format!("{} line {:08}\n", name, index).as_bytes());
        }
        fs::write(&path, data).unwrap();
        InputFile::stat(&path).unwrap()
    }

    fn out_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    fn lines_of(path: &PathBuf) -> Vec<Vec<u8>> {
        let data = fs::read(path).unwrap();
        data.split_inclusive(|byte| *byte == b'\n').map(|line| line.to_vec()).collect()
    }

    #[rstest]
    fn test_all_rate_copies_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_input(&dir, "first", 100);
        let second = write_input(&dir, "second", 50);
        let out = out_path(&dir, "out");

        let written = sampler()
            .sample(
                &[first.clone(), second.clone()],
                &[OutputSpec::new(&out, SampleTarget::All)],
                &mut rng(),
            )
            .unwrap();

        assert_eq!(written, vec![150]);
        let mut expected = fs::read(&first.path).unwrap();
        expected.extend_from_slice(&fs::read(&second.path).unwrap());
        assert_eq!(fs::read(&out).unwrap(), expected);
    }

    #[rstest]
    fn test_unterminated_input_copies_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail");
        fs::write(&path, b"one\ntwo\nthree").unwrap();
        let input = InputFile::stat(&path).unwrap();
        let out = out_path(&dir, "out");

        sampler()
            .sample(&[input], &[OutputSpec::new(&out, SampleTarget::All)], &mut rng())
            .unwrap();

        assert_eq!(fs::read(&out).unwrap(), b"one\ntwo\nthree".to_vec());
    }

    #[rstest]
    fn test_half_rate_lands_in_binomial_band() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(&dir, "input", 10_000);
        let out = out_path(&dir, "out");

        let written = sampler()
            .sample(
                &[input],
                &[OutputSpec::new(&out, SampleTarget::Rate(0.5))],
                &mut rng(),
            )
            .unwrap();

        // mean 5000, binomial standard deviation 50; ten sigmas of slack
        assert!((4500..=5500).contains(&(written[0] as usize)), "written {}", written[0]);
        assert_eq!(lines_of(&out).len(), written[0] as usize);
    }

    #[rstest]
    fn test_line_may_reach_several_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(&dir, "input", 200);
        let left = out_path(&dir, "left");
        let right = out_path(&dir, "right");

        let written = sampler()
            .sample(
                &[input.clone()],
                &[
                    OutputSpec::new(&left, SampleTarget::All),
                    OutputSpec::new(&right, SampleTarget::Rate(1.0)),
                ],
                &mut rng(),
            )
            .unwrap();

        assert_eq!(written, vec![200, 200]);
        let expected = fs::read(&input.path).unwrap();
        assert_eq!(fs::read(&left).unwrap(), expected);
        assert_eq!(fs::read(&right).unwrap(), expected);
    }

    #[rstest]
    fn test_count_target_must_be_normalized_first() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(&dir, "input", 10);
        let out = out_path(&dir, "out");

        let result = sampler().sample(
            &[input],
            &[OutputSpec::new(&out, SampleTarget::Count(5))],
            &mut rng(),
        );

        assert!(matches!(result, Err(SampleError::UnresolvedTarget { .. })));
    }

    #[rstest]
    fn test_shuffle_is_a_permutation() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(&dir, "input", 500);
        let out = out_path(&dir, "out");

        let plan = BufferPlan {
            interleave: 1,
            budget: 0,
        };
        let written = sampler()
            .shuffle(
                &[input.clone()],
                &[OutputSpec::new(&out, SampleTarget::All)],
                plan,
                &mut rng(),
            )
            .unwrap();

        assert_eq!(written, vec![500]);
        let original = lines_of(&input.path);
        let shuffled = lines_of(&out);
        assert_ne!(shuffled, original);

        let mut sorted_original = original;
        let mut sorted_shuffled = shuffled;
        sorted_original.sort();
        sorted_shuffled.sort();
        assert_eq!(sorted_shuffled, sorted_original);
    }

    #[rstest]
    #[case(2)]
    #[case(3)]
    #[case(7)]
    fn test_interleaved_shuffle_preserves_the_line_multiset(#[case] factor: u64) {
        let dir = tempfile::tempdir().unwrap();
        let first = write_input(&dir, "first", 301);
        let second = write_input(&dir, "second", 100);
        let out = out_path(&dir, "out");

        let plan = BufferPlan {
            interleave: factor,
            budget: 1 << 20,
        };
        let written = sampler()
            .shuffle(
                &[first.clone(), second.clone()],
                &[OutputSpec::new(&out, SampleTarget::All)],
                plan,
                &mut rng(),
            )
            .unwrap();

        assert_eq!(written, vec![401]);
        let mut expected = lines_of(&first.path);
        expected.extend(lines_of(&second.path));
        expected.sort();
        let mut actual = lines_of(&out);
        actual.sort();
        assert_eq!(actual, expected);
    }

    #[rstest]
    fn test_shuffle_samples_by_rate() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(&dir, "input", 10_000);
        let out = out_path(&dir, "out");

        let plan = BufferPlan {
            interleave: 1,
            budget: 0,
        };
        let written = sampler()
            .shuffle(
                &[input],
                &[OutputSpec::new(&out, SampleTarget::Rate(0.25))],
                plan,
                &mut rng(),
            )
            .unwrap();

        // mean 2500, standard deviation ~43
        assert!((2100..=2900).contains(&(written[0] as usize)), "written {}", written[0]);
    }

    #[rstest]
    fn test_quick_reservoir_hits_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(&dir, "input", 10_000);
        let out = out_path(&dir, "out");

        let written = sampler()
            .quick_sample(
                &input,
                &[OutputSpec::new(&out, SampleTarget::Count(100))],
                &mut rng(),
            )
            .unwrap();

        assert_eq!(written, vec![100]);
        let mut sampled = lines_of(&out);
        assert_eq!(sampled.len(), 100);
        // all sampled lines come from the input, no duplicates
        sampled.sort();
        sampled.dedup();
        assert_eq!(sampled.len(), 100);
        let original = lines_of(&input.path);
        assert!(sampled.iter().all(|line| original.contains(line)));
    }

    #[rstest]
    fn test_quick_with_fewer_lines_than_target_keeps_all() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(&dir, "input", 10);
        let out = out_path(&dir, "out");

        let written = sampler()
            .quick_sample(
                &input,
                &[OutputSpec::new(&out, SampleTarget::Count(50))],
                &mut rng(),
            )
            .unwrap();

        assert_eq!(written, vec![10]);
        let mut expected = lines_of(&input.path);
        expected.sort();
        let mut actual = lines_of(&out);
        actual.sort();
        assert_eq!(actual, expected);
    }

    #[rstest]
    fn test_quick_rejects_rate_targets() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(&dir, "input", 10);
        let out = out_path(&dir, "out");

        let result = sampler().quick_sample(
            &input,
            &[OutputSpec::new(&out, SampleTarget::Rate(0.5))],
            &mut rng(),
        );

        assert!(matches!(result, Err(SampleError::UnresolvedTarget { .. })));
    }

    #[rstest]
    fn test_missing_input_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(&dir, "input", 10);
        let out = out_path(&dir, "out");

        let mut gone = input.clone();
        gone.path = dir.path().join("absent");

        let result = sampler().sample(
            &[gone],
            &[OutputSpec::new(&out, SampleTarget::All)],
            &mut rng(),
        );

        match result {
            Err(SampleError::Input { path, .. }) => assert!(path.ends_with("absent")),
            other => panic!("expected an input error, got {:?}", other.map(|_| ())),
        }
    }
}
