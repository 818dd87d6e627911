use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use splatmesh_core::{Registry, SPLAT_ID_FILE_SHIFT, Splat, splat_id, split_splat_id};
use splatmesh_ply::PlyReader;

use crate::StoreError;

/// Size of one raw read buffer. Must hold at least one vertex record; files
/// with larger records are rejected at open time.
pub const BUFFER_SIZE: usize = 4 << 20;

/// Random-access view over an ordered list of splat files, addressed by
/// 64-bit global IDs (file index in the high bits).
pub struct SplatStore {
    files: Arc<Vec<PlyReader>>,
    total: u64,
    registry: Arc<Registry>,
}

impl SplatStore {
    pub fn open(
        paths: &[PathBuf],
        smooth: f32,
        registry: Arc<Registry>,
    ) -> Result<Self, StoreError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let reader = PlyReader::open(path, smooth)?;
            if reader.vertex_size() > BUFFER_SIZE {
                return Err(StoreError::HugeVertex { path: path.clone() });
            }
            files.push(reader);
        }
        let total = files.iter().map(|f| f.size()).sum();
        Ok(Self {
            files: Arc::new(files),
            total,
            registry,
        })
    }

    /// Total number of records across all files, non-finite ones included.
    pub fn size(&self) -> u64 {
        self.total
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, scan: usize) -> &PlyReader {
        &self.files[scan]
    }

    pub fn file_paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path())
    }

    /// Exclusive upper bound of the global ID space.
    pub fn id_end(&self) -> u64 {
        splat_id(self.files.len(), 0)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Contiguous fast path: decode records `[first, last)` of one file
    /// directly from its mapping. The caller is responsible for skipping
    /// records outside blob ranges (which never cover non-finite splats).
    pub fn read_splats(&self, scan: usize, first: u64, last: u64, out: &mut [Splat]) {
        self.files[scan].read_splats(first, last, out);
    }

    /// Stream finite splats of `[first, last)` in ID order through the
    /// background reader.
    pub fn stream(&self, first: u64, last: u64) -> SplatStream<'_> {
        let (req_tx, req_rx) = bounded::<(u64, u64)>(1);
        let (pool_tx, pool_rx) = bounded::<ReadItem>(2);
        let (out_tx, out_rx) = bounded::<Option<ReadItem>>(2);

        for _ in 0..2 {
            pool_tx
                .send(ReadItem {
                    first: 0,
                    count: 0,
                    buffer: Vec::with_capacity(BUFFER_SIZE),
                })
                .expect("fresh pool cannot be full");
        }

        let files = Arc::clone(&self.files);
        let handle = std::thread::Builder::new()
            .name("splat-reader".to_owned())
            .spawn(move || reader_loop(&files, &req_rx, &pool_rx, &out_tx))
            .expect("failed to spawn reader thread");

        let mut stream = SplatStream {
            store: self,
            req_tx: Some(req_tx),
            pool_tx,
            out_rx,
            handle: Some(handle),
            item: None,
            pos: 0,
            exhausted: true,
            skipped: 0,
        };
        stream.reset(first, last);
        stream
    }
}

struct ReadItem {
    /// Global ID of the first record in the buffer.
    first: u64,
    /// Number of records in the buffer.
    count: usize,
    buffer: Vec<u8>,
}

/// Background reader: services one ID-range request at a time, pushing
/// filled buffers from the two-slot pool. Requests end with a `None` marker;
/// a disconnected request channel stops the thread.
fn reader_loop(
    files: &[PlyReader],
    req_rx: &Receiver<(u64, u64)>,
    pool_rx: &Receiver<ReadItem>,
    out_tx: &Sender<Option<ReadItem>>,
) {
    for (mut first, last) in req_rx.iter() {
        while first < last {
            let (scan, start) = split_splat_id(first);
            if scan >= files.len() {
                break;
            }
            let file = &files[scan];
            let stride = file.vertex_size();
            let file_size = file.size();
            let max_records = (BUFFER_SIZE / stride) as u64;
            let mut end = (start + max_records).min(file_size);
            if (last >> SPLAT_ID_FILE_SHIFT) as usize == scan {
                end = end.min(last & splatmesh_core::SPLAT_ID_INDEX_MASK);
            }
            if start < end {
                let Ok(mut item) = pool_rx.recv() else { return };
                let count = (end - start) as usize;
                item.buffer.resize(count * stride, 0);
                file.read_raw(start, end, &mut item.buffer);
                item.first = first;
                item.count = count;
                if out_tx.send(Some(item)).is_err() {
                    return;
                }
                first += count as u64;
            }
            if end == file_size {
                first = splat_id(scan + 1, 0);
            }
        }
        if out_tx.send(None).is_err() {
            return;
        }
    }
}

/// Consumer side of the background reader: an iterator of `(id, splat)` in
/// ID order, restartable via [`SplatStream::reset`]. Non-finite records are
/// skipped and counted.
pub struct SplatStream<'a> {
    store: &'a SplatStore,
    req_tx: Option<Sender<(u64, u64)>>,
    pool_tx: Sender<ReadItem>,
    out_rx: Receiver<Option<ReadItem>>,
    handle: Option<JoinHandle<()>>,
    item: Option<ReadItem>,
    pos: usize,
    exhausted: bool,
    skipped: u64,
}

impl SplatStream<'_> {
    /// Abandon the current request and start over on `[first, last)`.
    pub fn reset(&mut self, first: u64, last: u64) {
        assert!(first <= last);
        self.drain();
        if let Some(req) = &self.req_tx
            && req.send((first, last)).is_ok()
        {
            self.exhausted = false;
        }
    }

    fn drain(&mut self) {
        if let Some(item) = self.item.take() {
            let _ = self.pool_tx.send(item);
        }
        while !self.exhausted {
            match self.out_rx.recv() {
                Ok(Some(item)) => {
                    let _ = self.pool_tx.send(item);
                }
                Ok(None) | Err(_) => self.exhausted = true,
            }
        }
    }
}

impl Iterator for SplatStream<'_> {
    type Item = (u64, Splat);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = &self.item {
                if self.pos < item.count {
                    let (scan, _) = split_splat_id(item.first);
                    let splat = self.store.files[scan].decode(&item.buffer, self.pos);
                    let id = item.first + self.pos as u64;
                    self.pos += 1;
                    if splat.is_finite() {
                        return Some((id, splat));
                    }
                    self.skipped += 1;
                    continue;
                }
                let item = self.item.take().expect("checked above");
                let _ = self.pool_tx.send(item);
            }
            if self.exhausted {
                return None;
            }
            match self.out_rx.recv() {
                Ok(Some(item)) => {
                    self.item = Some(item);
                    self.pos = 0;
                }
                Ok(None) | Err(_) => {
                    self.exhausted = true;
                    return None;
                }
            }
        }
    }
}

impl Drop for SplatStream<'_> {
    fn drop(&mut self) {
        self.drain();
        drop(self.req_tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if self.skipped > 0 {
            self.store
                .registry
                .add("store.nonfinite", self.skipped as f64);
        }
    }
}
