//! Bulk download of stored measurements.
//!
//! The instrument only answers paged queries, one at a time:
//!
//! 1. result count
//! 2. for every measurement `i`: packet count of `i`
//! 3. for every packet `j` of `i`: data packet `(i, j)`
//!
//! Payloads of one measurement are concatenated in packet order into a
//! [`MeasurementRecord`]. The first failed request ends the run.

use {
    crate::{
        error::{Error, Result},
        link::Link,
        protocol::{Command, ResultQuery, decode_count},
        transport::Transport,
    },
    log::{debug, info},
    std::{sync::Arc, time::Duration},
};

/// Default pause between successive data packet requests.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(50);

/// Tuning for a download run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Wait for each response.
    pub request_timeout: Duration,
    /// Pause between data packet requests.
    pub throttle: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            request_timeout: crate::link::DEFAULT_REQUEST_TIMEOUT,
            throttle: DEFAULT_THROTTLE,
        }
    }
}

/// One stored measurement, reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementRecord {
    /// 1-based index on the instrument.
    pub index: u16,
    /// Concatenated data packet payloads.
    pub data: Vec<u8>,
}

/// Progress after a completed measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Measurements completed so far.
    pub current: u16,
    /// Measurements reported by the instrument.
    pub total: u16,
}

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Records in index order.
    pub records: Vec<MeasurementRecord>,
}

impl DownloadReport {
    /// All records back to back, in index order.
    pub fn combined(&self) -> Vec<u8> {
        self.records
            .iter()
            .flat_map(|record| record.data.iter().copied())
            .collect()
    }

    /// Total payload bytes.
    pub fn total_bytes(&self) -> usize {
        self.records.iter().map(|record| record.data.len()).sum()
    }
}

type InterruptChecker = Arc<dyn Fn() -> bool + Send + Sync>;

/// Pages through every stored measurement of a verified link.
pub struct MeasurementDownloader<'a, T: Transport> {
    link: &'a Link<T>,
    options: DownloadOptions,
    interrupted: InterruptChecker,
}

impl<'a, T: Transport> MeasurementDownloader<'a, T> {
    /// Downloader with default options, stopping on the global interrupt checker.
    pub fn new(link: &'a Link<T>) -> Self {
        Self {
            link,
            options: DownloadOptions::default(),
            interrupted: Arc::new(crate::is_interrupted_requested),
        }
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: DownloadOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the interruption check run before every request.
    #[must_use]
    pub fn with_interrupt_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.interrupted = Arc::new(checker);
        self
    }

    /// Run the download.
    ///
    /// `sink` receives each record as soon as it is complete; `progress` is
    /// called right after. Records already handed to `sink` stay there when
    /// a later request fails.
    pub async fn run(
        &self,
        progress: &mut dyn FnMut(DownloadProgress),
        sink: &mut dyn FnMut(&MeasurementRecord) -> Result<()>,
    ) -> Result<DownloadReport> {
        let total = self.count(ResultQuery::Count, 0).await?;
        if total == 0 {
            info!("No stored measurements");
            return Ok(DownloadReport::default());
        }
        info!("Downloading {total} measurements");

        let mut records = Vec::with_capacity(usize::from(total));
        let mut data_requests = 0usize;

        for index in 1..=total {
            let packets = self
                .count(ResultQuery::PacketCount { measurement: index }, index)
                .await?;
            debug!("Measurement {index}: {packets} packets");

            let mut data = Vec::new();
            for packet in 1..=packets {
                if data_requests > 0 && !self.options.throttle.is_zero() {
                    tokio::time::sleep(self.options.throttle).await;
                }
                let query = ResultQuery::Data {
                    measurement: index,
                    packet,
                };
                let payload = self.query(query, index, Some(packet)).await?;
                data_requests += 1;
                data.extend_from_slice(&payload);
            }

            let record = MeasurementRecord { index, data };
            sink(&record).map_err(|e| aborted(index, None, e))?;
            debug!("Measurement {index} complete: {} bytes", record.data.len());
            records.push(record);
            progress(DownloadProgress {
                current: index,
                total,
            });
        }

        Ok(DownloadReport { records })
    }

    async fn count(&self, query: ResultQuery, measurement: u16) -> Result<u16> {
        let payload = self.query(query, measurement, None).await?;
        let count = decode_count(&payload).map_err(|e| aborted(measurement, None, e))?;
        u16::try_from(count).map_err(|_| {
            aborted(
                measurement,
                None,
                Error::Protocol(format!("count {count} out of range")),
            )
        })
    }

    async fn query(
        &self,
        query: ResultQuery,
        measurement: u16,
        packet: Option<u16>,
    ) -> Result<Vec<u8>> {
        if (self.interrupted)() {
            return Err(Error::Interrupted);
        }
        let command = u8::from(Command::ResultGet);
        self.link
            .request(command, &query.payload(), command, self.options.request_timeout)
            .await
            .map_err(|e| aborted(measurement, packet, e))
    }
}

fn aborted(measurement: u16, packet: Option<u16>, source: Error) -> Error {
    Error::DownloadAborted {
        measurement,
        packet,
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkConfig;
    use crate::protocol::Packet;
    use crate::sim::{SimDevice, SimHandle, identity_payload};
    use crate::transport::MemoryTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    async fn verified(device: SimDevice) -> (Link<MemoryTransport>, SimHandle) {
        let (transport, end) = MemoryTransport::pair("sim");
        let sim = device.spawn(end);
        let link = Link::new(transport, LinkConfig::default());
        link.connect().await.unwrap();
        (link, sim)
    }

    fn downloader<T: Transport>(link: &Link<T>) -> MeasurementDownloader<'_, T> {
        MeasurementDownloader::new(link).with_interrupt_checker(|| false)
    }

    fn two_measurements() -> SimDevice {
        SimDevice::new(identity_payload(0x0010, 0x0001)).with_measurements(vec![
            vec![vec![0xAA, 0xBB], vec![0xCC, 0xDD]],
            vec![vec![0x11]],
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_two_measurements() {
        let (link, sim) = verified(two_measurements()).await;

        let mut progress = Vec::new();
        let mut exported = Vec::new();
        let report = downloader(&link)
            .run(&mut |p| progress.push((p.current, p.total)), &mut |record| {
                exported.push(record.index);
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(
            report.records,
            vec![
                MeasurementRecord {
                    index: 1,
                    data: vec![0xAA, 0xBB, 0xCC, 0xDD]
                },
                MeasurementRecord {
                    index: 2,
                    data: vec![0x11]
                },
            ]
        );
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
        assert_eq!(exported, vec![1, 2]);
        assert_eq!(report.combined(), vec![0xAA, 0xBB, 0xCC, 0xDD, 0x11]);
        assert_eq!(report.total_bytes(), 5);

        let queries: Vec<ResultQuery> = sim.requests()[1..]
            .iter()
            .map(|p| ResultQuery::parse(&p.data).unwrap())
            .collect();
        assert_eq!(
            queries,
            vec![
                ResultQuery::Count,
                ResultQuery::PacketCount { measurement: 1 },
                ResultQuery::Data {
                    measurement: 1,
                    packet: 1
                },
                ResultQuery::Data {
                    measurement: 1,
                    packet: 2
                },
                ResultQuery::PacketCount { measurement: 2 },
                ResultQuery::Data {
                    measurement: 2,
                    packet: 1
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_measurements_short_circuit() {
        let device = SimDevice::new(identity_payload(0x0010, 0x0001));
        let (link, sim) = verified(device).await;

        let mut calls = 0;
        let report = downloader(&link)
            .run(&mut |_| calls += 1, &mut |_| Ok(()))
            .await
            .unwrap();

        assert!(report.records.is_empty());
        assert_eq!(calls, 0);
        assert_eq!(
            sim.requests(),
            vec![
                Packet::new(0x01, Vec::new()),
                Packet::new(0x20, vec![ResultQuery::COUNT]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_whole_run() {
        let (link, sim) = verified(two_measurements().with_dropped_data(1, 2)).await;

        let exported = AtomicUsize::new(0);
        let err = downloader(&link)
            .run(&mut |_| {}, &mut |_| {
                exported.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .await
            .unwrap_err();

        match &err {
            Error::DownloadAborted {
                measurement,
                packet,
                source,
            } => {
                assert_eq!(*measurement, 1);
                assert_eq!(*packet, Some(2));
                assert!(matches!(**source, Error::RequestTimeout { command: 0x20 }));
            },
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_timeout());
        assert_eq!(exported.load(Ordering::Relaxed), 0);
        // No retry, nothing after the failed request.
        assert_eq!(sim.requests().len(), 5);
        assert!(link.is_verified());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_records_stay_exported() {
        let (link, _sim) = verified(two_measurements().with_dropped_data(2, 1)).await;

        let mut exported = Vec::new();
        let mut progress = Vec::new();
        let err = downloader(&link)
            .run(&mut |p| progress.push(p.current), &mut |record| {
                exported.push(record.clone());
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::DownloadAborted {
                measurement: 2,
                packet: Some(1),
                ..
            }
        ));
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].data, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(progress, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_aborts() {
        let (link, _sim) = verified(two_measurements()).await;

        let err = downloader(&link)
            .run(&mut |_| {}, &mut |_| Err(Error::Io(std::io::Error::other("disk full"))))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DownloadAborted {
                measurement: 1,
                packet: None,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_between_data_requests() {
        let (link, _sim) = verified(two_measurements()).await;

        let started = Instant::now();
        let options = DownloadOptions {
            throttle: Duration::from_millis(100),
            ..DownloadOptions::default()
        };
        downloader(&link)
            .with_options(options)
            .run(&mut |_| {}, &mut |_| Ok(()))
            .await
            .unwrap();

        // Three data requests, two pauses.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_before_first_request() {
        let (link, sim) = verified(two_measurements()).await;

        let err = MeasurementDownloader::new(&link)
            .with_interrupt_checker(|| true)
            .run(&mut |_| {}, &mut |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(sim.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requires_verified_link() {
        let (transport, _end) = MemoryTransport::pair("sim");
        let link = Link::new(transport, LinkConfig::default());

        let err = downloader(&link)
            .run(&mut |_| {}, &mut |_| Ok(()))
            .await
            .unwrap_err();
        match err {
            Error::DownloadAborted { source, .. } => {
                assert!(matches!(*source, Error::NotConnected));
            },
            other => panic!("unexpected error {other:?}"),
        }
    }
}
