//! File byte-stream sources.
//!
//! A source delivers the entire content of a file, start to end, as a sequence
//! of non-overlapping chunks passed to a consumer callback, each chunk exactly
//! once, in file order, with no gaps or repeats. A chunk is only valid for the
//! duration of the callback invocation. All strategies share this contract and
//! differ only in throughput characteristics, so picking one is a runtime
//! configuration decision.

use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use std::sync::mpsc;
use std::thread;

use memmap2::Mmap;

/// Default chunk size of the reading strategies.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of outstanding reads of the windowed strategy.
pub const DEFAULT_WINDOW: usize = 3;

/// Byte-stream source interface.
///
/// The first I/O or consumer error ends the stream early; it is returned once
/// and the consumer is not invoked again for that file. End of file ends the
/// stream successfully without further calls.
pub trait ByteSource {
    /// Streams the file at `path` into `consumer` chunk by chunk.
    /// Returns the number of bytes delivered.
    fn stream(&self, path: &Path, consumer: &mut dyn FnMut(&[u8]) -> io::Result<()>) -> io::Result<u64>;
}

/// Strategy mapping the whole file into the address space and delivering it
/// as a single chunk. Lowest overhead for files that fit the address space,
/// avoids a user-space copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct MappedSource;

impl ByteSource for MappedSource {
    fn stream(&self, path: &Path, consumer: &mut dyn FnMut(&[u8]) -> io::Result<()>) -> io::Result<u64> {
        let file = fs::File::open(path)?;
        let len = file.metadata()?.len();
        // mapping a zero-length file is rejected on some platforms
        if len == 0 {
            return Ok(0);
        }

        let map = unsafe { Mmap::map(&file)? };
        #[cfg(unix)]
        let _ = map.advise(memmap2::Advice::Sequential);

        consumer(&map)?;

        return Ok(map.len() as u64);
    }
}

/// Strategy reading fixed-size chunks into a reusable buffer until end of
/// file. Simplest, works everywhere, one copy per chunk, fully serialized
/// with consumption.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedSource {
    chunk_size: usize,
}

impl ChunkedSource {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        ChunkedSource { chunk_size }
    }
}

impl Default for ChunkedSource {
    fn default() -> Self {
        ChunkedSource::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ByteSource for ChunkedSource {
    fn stream(&self, path: &Path, consumer: &mut dyn FnMut(&[u8]) -> io::Result<()>) -> io::Result<u64> {
        let mut file = fs::File::open(path)?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;

        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            consumer(&buf[..read])?;
            total += read as u64;
        }

        return Ok(total);
    }
}

/// Strategy keeping up to `window` reads in flight while the consumer drains
/// completed chunks strictly in file order.
///
/// Each of the `window` slots is served by its own reader thread owning a
/// small ring of buffers; slot *j* reads chunk indices congruent to *j*
/// modulo `window` through an independent file handle. A completed buffer is
/// lent to the consumer for one callback and then returned to its slot for
/// reuse, so read-ahead never exceeds the window.
#[derive(Debug, Clone, Copy)]
pub struct WindowedSource {
    chunk_size: usize,
    window: usize,
}

impl WindowedSource {
    pub fn new(chunk_size: usize, window: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        assert!(window > 0, "window must be positive");
        WindowedSource { chunk_size, window }
    }
}

impl Default for WindowedSource {
    fn default() -> Self {
        WindowedSource::new(DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW)
    }
}

/// One buffer per slot bounds read-ahead to `window` chunks in total.
const SLOT_BUFFERS: usize = 1;

struct Slot {
    completed: mpsc::Receiver<io::Result<Vec<u8>>>,
    free: mpsc::Sender<Vec<u8>>,
}

impl ByteSource for WindowedSource {
    fn stream(&self, path: &Path, consumer: &mut dyn FnMut(&[u8]) -> io::Result<()>) -> io::Result<u64> {
        let window = self.window;
        let mut slots = Vec::with_capacity(window);
        let mut readers = Vec::with_capacity(window);

        for slot_index in 0..window {
            let (completed_tx, completed_rx) = mpsc::sync_channel(1);
            let (free_tx, free_rx) = mpsc::channel();
            for _ in 0..SLOT_BUFFERS {
                free_tx.send(vec![0u8; self.chunk_size]).expect("channel is open");
            }

            let path = path.to_path_buf();
            let chunk_size = self.chunk_size;
            readers.push(thread::spawn(move || {
                read_slot(&path, slot_index, window, chunk_size, completed_tx, free_rx);
            }));
            slots.push(Slot {
                completed: completed_rx,
                free: free_tx,
            });
        }

        let mut total = 0u64;
        let mut result = Ok(());

        for index in 0usize.. {
            match slots[index % window].completed.recv() {
                Ok(Ok(buf)) => {
                    if buf.is_empty() {
                        break;
                    }
                    let last = buf.len() < self.chunk_size;
                    total += buf.len() as u64;
                    if let Err(err) = consumer(&buf) {
                        result = Err(err);
                        break;
                    }
                    // the buffer reverts to its slot for the next read
                    let _ = slots[index % window].free.send(buf);
                    if last {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    result = Err(err);
                    break;
                }
                // reader gone, nothing more to consume
                Err(mpsc::RecvError) => break,
            }
        }

        // closing the channels unblocks any reader still waiting on a send
        drop(slots);
        for reader in readers {
            let _ = reader.join();
        }

        return result.map(|()| total);
    }
}

/// Reads chunk indices `first`, `first + stride`, ... into recycled buffers,
/// in order, until end of file. A short or empty chunk marks the end; an
/// empty buffer is sent as the end-of-stream marker so the consumer can stop
/// at the right position of the interleaved sequence.
fn read_slot(
    path: &Path,
    first: usize,
    stride: usize,
    chunk_size: usize,
    completed: mpsc::SyncSender<io::Result<Vec<u8>>>,
    free: mpsc::Receiver<Vec<u8>>,
) {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            let _ = completed.send(Err(err));
            return;
        }
    };

    let mut index = first as u64;
    loop {
        let mut buf = match free.recv() {
            Ok(buf) => buf,
            // consumer stopped, recycle ring is closed
            Err(mpsc::RecvError) => return,
        };
        buf.resize(chunk_size, 0);

        let filled = match fill_chunk(&mut file, index * chunk_size as u64, &mut buf) {
            Ok(filled) => filled,
            Err(err) => {
                let _ = completed.send(Err(err));
                return;
            }
        };
        buf.truncate(filled);

        let done = filled < chunk_size;
        if completed.send(Ok(buf)).is_err() || done {
            return;
        }
        index += stride as u64;
    }
}

/// Fills `buf` from the file position `offset`, stopping early at end of
/// file. Returns the number of bytes read.
fn fill_chunk(file: &mut fs::File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek(io::SeekFrom::Start(offset))?;

    let mut filled = 0;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }

    return Ok(filled);
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;
    use std::path::Path;

    use rstest::*;

    use super::{ByteSource, ChunkedSource, MappedSource, WindowedSource};

    const CHUNK: usize = 32;

    /// Position-dependent byte pattern, so any reordered, repeated or dropped
    /// chunk breaks the concatenation check.
    fn pattern(len: usize) -> Vec<u8> {
        Vec::from_iter((0..len).map(|i| (i % 251) as u8))
    }

    fn write_file(dir: &tempfile::TempDir, len: usize) -> std::path::PathBuf {
        let path = dir.path().join(format!("input-{}", len));
        fs::write(&path, pattern(len)).unwrap();
        path
    }

    fn collect(source: &dyn ByteSource, path: &Path) -> io::Result<(Vec<u8>, Vec<usize>)> {
        let mut data = Vec::new();
        let mut chunk_sizes = Vec::new();
        let total = source.stream(path, &mut |chunk| {
            data.extend_from_slice(chunk);
            chunk_sizes.push(chunk.len());
            Ok(())
        })?;
        assert_eq!(total, data.len() as u64);
        Ok((data, chunk_sizes))
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(CHUNK - 1)]
    #[case(CHUNK)]
    #[case(CHUNK + 1)]
    #[case(10 * CHUNK)]
    fn test_delivers_whole_file(#[case] len: usize) {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, len);

        let sources: [&dyn ByteSource; 3] = [
            &MappedSource,
            &ChunkedSource::new(CHUNK),
            &WindowedSource::new(CHUNK, 3),
        ];
        for source in sources {
            let (data, _) = collect(source, &path).unwrap();
            assert_eq!(data, pattern(len));
        }
    }

    #[rstest]
    fn test_windowed_chunks_are_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 10 * CHUNK + 7);

        let source = WindowedSource::new(CHUNK, 3);
        let (data, chunk_sizes) = collect(&source, &path).unwrap();

        assert_eq!(data, pattern(10 * CHUNK + 7));
        assert_eq!(chunk_sizes.len(), 11);
        assert!(chunk_sizes[..10].iter().all(|size| *size == CHUNK));
        assert_eq!(chunk_sizes[10], 7);
    }

    #[rstest]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");

        let sources: [&dyn ByteSource; 3] = [
            &MappedSource,
            &ChunkedSource::default(),
            &WindowedSource::default(),
        ];
        for source in sources {
            assert!(collect(source, &path).is_err());
        }
    }

    #[rstest]
    fn test_consumer_error_stops_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, 10 * CHUNK);

        let sources: [&dyn ByteSource; 2] = [&ChunkedSource::new(CHUNK), &WindowedSource::new(CHUNK, 3)];
        for source in sources {
            let mut calls = 0;
            let result = source.stream(&path, &mut |_chunk| {
                calls += 1;
                if calls == 2 {
                    Err(io::Error::new(io::ErrorKind::Other, "consumer failed"))
                } else {
                    Ok(())
                }
            });
            assert!(result.is_err());
            assert_eq!(calls, 2);
        }
    }
}
