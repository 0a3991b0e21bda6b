use std::io;

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::weighted::WeightedIndex;
use rand_distr::{Distribution, LogNormal, Zipf};

/// Smallest generated payload. Tiny payloads would collide on content and
/// be rejected as duplicates.
const MIN_PAYLOAD_SIZE: u64 = 64;

pub struct WorkloadBuilder {
    name: &'static str,
    concurrency: usize,
    seed: u64,

    p50_size: u64,
    p99_size: u64,

    upload_weight: u8,
    cancel_weight: u8,
    delete_weight: u8,
}

impl WorkloadBuilder {
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn size_distribution(mut self, p50: u64, p99: u64) -> Self {
        self.p50_size = p50;
        self.p99_size = p99;
        self
    }

    pub fn action_weights(mut self, uploads: u8, cancels: u8, deletes: u8) -> Self {
        self.upload_weight = uploads;
        self.cancel_weight = cancels;
        self.delete_weight = deletes;
        self
    }

    pub fn build(self) -> anyhow::Result<Workload> {
        let rng = SmallRng::seed_from_u64(self.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = self.p50_size as f64;
        let p99 = self.p99_size as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;

        let size_distribution = LogNormal::new(mu, sigma)?;
        let action_distribution =
            WeightedIndex::new([self.upload_weight, self.cancel_weight, self.delete_weight])?;

        Ok(Workload {
            name: self.name,
            concurrency: self.concurrency,
            p50_size: self.p50_size,
            p99_size: self.p99_size,

            rng,
            size_distribution,
            action_distribution,

            committed_files: Default::default(),
        })
    }
}

pub struct Workload {
    pub name: &'static str,
    pub concurrency: usize,
    pub p50_size: u64,
    pub p99_size: u64,

    /// The RNG driving all our distributions.
    rng: SmallRng,
    /// A distribution that generates payload sizes for uploads.
    size_distribution: LogNormal<f64>,
    /// A distribution that picks upload/cancel/delete.
    action_distribution: WeightedIndex<u8>,

    /// Files that finished uploading and may be deleted.
    committed_files: Vec<FileId>,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            name,
            concurrency: std::thread::available_parallelism().map_or(4, |n| n.get()),
            seed: rand::random(),

            p50_size: 16 * 1024,
            p99_size: 1024 * 1024,

            upload_weight: 80,
            cancel_weight: 10,
            delete_weight: 10,
        }
    }

    fn get_payload(&self, seed: u64) -> Payload {
        let mut rng = SmallRng::seed_from_u64(seed);
        let len = (self.size_distribution.sample(&mut rng) as u64).max(MIN_PAYLOAD_SIZE);

        Payload { len, rng }
    }

    /// Picks a committed file, preferring recent ones.
    fn sample_committed(&mut self) -> Option<FileId> {
        if self.committed_files.is_empty() {
            return None;
        }
        let len = self.committed_files.len();
        let zipf = Zipf::new(len as f64, 2.0).ok()?;
        let idx = len - self.rng.sample(zipf) as usize;

        Some(self.committed_files.remove(idx))
    }

    pub fn next_action(&mut self) -> Action {
        loop {
            match self.action_distribution.sample(&mut self.rng) {
                0 => {
                    let seed = self.rng.next_u64();
                    return Action::Upload(FileId(seed), self.get_payload(seed));
                }
                1 => {
                    let seed = self.rng.next_u64();
                    return Action::CancelMidway(FileId(seed), self.get_payload(seed));
                }
                _ => {
                    let Some(file) = self.sample_committed() else {
                        continue;
                    };
                    return Action::Delete(file);
                }
            }
        }
    }

    /// Records a committed upload so it can be yielded for deletion.
    ///
    /// Files handed out for deletion are removed from the pool, so a file is
    /// never deleted twice.
    pub fn push_file(&mut self, file: FileId) {
        self.committed_files.push(file)
    }
}

#[derive(Debug, Clone, Copy, Eq, Hash, PartialEq)]
pub struct FileId(u64);

impl FileId {
    pub fn file_name(&self) -> String {
        format!("stress-{:016x}.bin", self.0)
    }
}

pub enum Action {
    Upload(FileId, Payload),
    CancelMidway(FileId, Payload),
    Delete(FileId),
}

pub struct Payload {
    pub len: u64,
    pub rng: SmallRng,
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len_to_fill = (buf.len() as u64).min(self.len) as usize;

        let fill_buf = &mut buf[..len_to_fill];
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        Ok(len_to_fill)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn lognormal_percentiles_work() {
        let workload = Workload::builder("test")
            .size_distribution(100, 1000)
            .build()
            .unwrap();

        let mut sizes: Vec<_> = (0..100)
            .map(|seed| workload.get_payload(seed).len)
            .collect();
        sizes.sort_unstable();

        assert!(sizes[0] >= MIN_PAYLOAD_SIZE);
        assert!(sizes[50] > 50 && sizes[50] < 200, "{sizes:?}");
    }

    #[test]
    fn payloads_are_reproducible() {
        let workload = Workload::builder("test").build().unwrap();

        let mut first = Vec::new();
        workload.get_payload(7).read_to_end(&mut first).unwrap();
        let mut second = Vec::new();
        workload.get_payload(7).read_to_end(&mut second).unwrap();

        assert_eq!(first.len() as u64, workload.get_payload(7).len);
        assert_eq!(first, second);
    }

    #[test]
    fn deletes_only_committed_files() {
        let mut workload = Workload::builder("test")
            .seed(1)
            .action_weights(0, 0, 1)
            .build()
            .unwrap();

        workload.push_file(FileId(42));
        match workload.next_action() {
            Action::Delete(file) => assert_eq!(file, FileId(42)),
            _ => panic!("expected a delete"),
        }
        assert!(workload.sample_committed().is_none());
    }
}
