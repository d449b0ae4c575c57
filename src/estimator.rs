//! Request-size-to-work estimators.
//!
//! All analysis operates on abstract "work" whose units only have to match
//! the queue bandwidths: bytes for network queues (bytes/sec bandwidth),
//! seconds of device time for storage queues (bandwidth 1 work-sec/sec).
//! Estimators hide the request-type differences behind that conversion:
//! writes carry the data on the way in, reads on the way out, and SSDs serve
//! different request sizes at different bandwidths.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("bandwidth table is empty")]
    EmptyTable,
    #[error("bandwidth table entries must be positive")]
    NonPositiveBandwidth,
}

/// Affine translation parameters for one direction of network traffic.
///
/// Data-heavy requests (the direction carrying payload) use the `data_*`
/// pair; the opposite direction only sees headers and acknowledgements.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetworkParams {
    #[serde(rename = "nonDataConstant")]
    pub non_data_constant: f64,
    #[serde(rename = "nonDataFactor")]
    pub non_data_factor: f64,
    #[serde(rename = "dataConstant")]
    pub data_constant: f64,
    #[serde(rename = "dataFactor")]
    pub data_factor: f64,
}

/// One row of an SSD profile: measured bandwidths at a given request size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandwidthEntry {
    #[serde(rename = "requestSize")]
    pub request_size: u64,
    #[serde(rename = "readBandwidth")]
    pub read_bandwidth: f64,
    #[serde(rename = "writeBandwidth")]
    pub write_bandwidth: f64,
}

/// Persisted storage profile, sorted by request size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageProfile {
    #[serde(rename = "bandwidthTable")]
    pub bandwidth_table: Vec<BandwidthEntry>,
}

/// One direction's (request size, bandwidth) profile point.
#[derive(Debug, Clone, Copy)]
pub struct TablePoint {
    pub request_size: u64,
    pub bandwidth: f64,
}

/// Work estimator for a flow direction or device.
#[derive(Debug, Clone)]
pub enum Estimator {
    /// Traffic from the workload VM toward the server: writes are data-heavy.
    NetworkIn(NetworkParams),
    /// Traffic from the server back to the VM: reads are data-heavy.
    NetworkOut(NetworkParams),
    /// SSD storage at the server; work is device seconds interpolated from a
    /// measured bandwidth profile.
    StorageSsd {
        read_table: Vec<TablePoint>,
        write_table: Vec<TablePoint>,
    },
}

impl Estimator {
    pub fn storage_ssd(profile: &StorageProfile) -> Result<Estimator, EstimatorError> {
        if profile.bandwidth_table.is_empty() {
            return Err(EstimatorError::EmptyTable);
        }
        if profile
            .bandwidth_table
            .iter()
            .any(|e| e.read_bandwidth <= 0.0 || e.write_bandwidth <= 0.0)
        {
            return Err(EstimatorError::NonPositiveBandwidth);
        }
        Ok(Estimator::StorageSsd {
            read_table: profile
                .bandwidth_table
                .iter()
                .map(|e| TablePoint {
                    request_size: e.request_size,
                    bandwidth: e.read_bandwidth,
                })
                .collect(),
            write_table: profile
                .bandwidth_table
                .iter()
                .map(|e| TablePoint {
                    request_size: e.request_size,
                    bandwidth: e.write_bandwidth,
                })
                .collect(),
        })
    }

    /// Estimate the work a request of the given size and direction demands.
    pub fn work(&self, request_size: u64, is_read: bool) -> f64 {
        match self {
            Estimator::NetworkIn(p) => affine(p, request_size, !is_read),
            Estimator::NetworkOut(p) => affine(p, request_size, is_read),
            Estimator::StorageSsd {
                read_table,
                write_table,
            } => {
                let table = if is_read { read_table } else { write_table };
                request_size as f64 / lookup_bandwidth(table, request_size)
            }
        }
    }
}

fn affine(p: &NetworkParams, request_size: u64, data_heavy: bool) -> f64 {
    if data_heavy {
        p.data_constant + p.data_factor * request_size as f64
    } else {
        p.non_data_constant + p.non_data_factor * request_size as f64
    }
}

/// Interpolate the bandwidth for a request size; outside the profiled range
/// the boundary bandwidth is used.
fn lookup_bandwidth(table: &[TablePoint], request_size: u64) -> f64 {
    let first = table.first().unwrap();
    if request_size <= first.request_size {
        return first.bandwidth;
    }
    for pair in table.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if request_size < hi.request_size {
            return linear_interpolate(
                request_size as f64,
                lo.request_size as f64,
                hi.request_size as f64,
                lo.bandwidth,
                hi.bandwidth,
            );
        }
    }
    table.last().unwrap().bandwidth
}

fn linear_interpolate(x: f64, x0: f64, x1: f64, y0: f64, y1: f64) -> f64 {
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssd() -> Estimator {
        let profile = StorageProfile {
            bandwidth_table: vec![
                BandwidthEntry { request_size: 1, read_bandwidth: 0.5, write_bandwidth: 0.5 },
                BandwidthEntry { request_size: 2, read_bandwidth: 1.0, write_bandwidth: 0.5 },
                BandwidthEntry { request_size: 4, read_bandwidth: 2.0, write_bandwidth: 1.0 },
                BandwidthEntry { request_size: 6, read_bandwidth: 3.0, write_bandwidth: 1.5 },
            ],
        };
        Estimator::storage_ssd(&profile).unwrap()
    }

    #[test]
    fn network_estimators_pick_direction_dependent_params() {
        let params = NetworkParams {
            non_data_constant: 200.0,
            non_data_factor: 0.025,
            data_constant: 200.0,
            data_factor: 1.1,
        };
        let inbound = Estimator::NetworkIn(params);
        let outbound = Estimator::NetworkOut(params);
        // writes are data-heavy inbound, reads outbound
        assert_eq!(inbound.work(1000, false), 200.0 + 1.1 * 1000.0);
        assert_eq!(inbound.work(1000, true), 200.0 + 0.025 * 1000.0);
        assert_eq!(outbound.work(1000, true), 200.0 + 1.1 * 1000.0);
        assert_eq!(outbound.work(1000, false), 200.0 + 0.025 * 1000.0);
    }

    #[test]
    fn ssd_interpolates_between_profile_rows() {
        let est = ssd();
        // exact rows
        assert_eq!(est.work(2, true), 2.0 / 1.0);
        assert_eq!(est.work(4, false), 4.0 / 1.0);
        // midway between rows 2 and 4 the read bandwidth is 1.5
        assert_eq!(est.work(3, true), 3.0 / 1.5);
    }

    #[test]
    fn ssd_clamps_outside_the_profiled_range() {
        let est = ssd();
        assert_eq!(est.work(0, true), 0.0 / 0.5);
        assert_eq!(est.work(100, true), 100.0 / 3.0);
        assert_eq!(est.work(100, false), 100.0 / 1.5);
    }

    #[test]
    fn profile_json_round_trips() {
        let json = r#"{"bandwidthTable":[{"requestSize":4096,"readBandwidth":5e8,"writeBandwidth":2.5e8}]}"#;
        let profile: StorageProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.bandwidth_table[0].request_size, 4096);
        let est = Estimator::storage_ssd(&profile).unwrap();
        assert_eq!(est.work(8192, true), 8192.0 / 5e8);
    }

    #[test]
    fn empty_profile_is_rejected() {
        let profile = StorageProfile {
            bandwidth_table: vec![],
        };
        assert!(Estimator::storage_ssd(&profile).is_err());
    }
}
