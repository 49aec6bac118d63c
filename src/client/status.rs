//! Resource status aggregation
//!
//! Combines the client's own status with what its consumers and publisher
//! last reported into one list of [`ResourceStatus`] records. Pure function
//! over snapshots; the supervisor collects the inputs.

use crate::model::{
    Connection, ConnectivityStatus, ConsumerKey, ResourceStatus, ResourceType, StatusReport,
};
use std::collections::BTreeMap;

pub struct StatusInputs<'a> {
    pub client_id: &'a str,
    pub connection: &'a Connection,
    pub client: StatusReport,
    /// Whether the client currently holds a live connection
    pub connected: bool,
    pub consumers: Vec<(ConsumerKey, StatusReport)>,
    /// Per resolved target address, empty when no publisher runs
    pub targets: BTreeMap<String, StatusReport>,
}

/// One record for the client, one per source address, one per target address
pub fn aggregate(inputs: StatusInputs<'_>) -> Vec<ResourceStatus> {
    let mut statuses = vec![record(
        ResourceType::Client,
        inputs.client_id,
        None,
        inputs.client,
    )];

    let mut per_address: BTreeMap<&str, StatusReport> = BTreeMap::new();
    for (key, report) in &inputs.consumers {
        per_address
            .entry(key.address.as_str())
            .and_modify(|current| {
                if report.status.severity() > current.status.severity() {
                    *current = report.clone();
                }
            })
            .or_insert_with(|| report.clone());
    }

    for address in inputs.connection.source_addresses() {
        let report = per_address
            .get(address.as_str())
            .cloned()
            .unwrap_or_else(|| missing(inputs.connected, "no consumer running"));
        statuses.push(record(
            ResourceType::Source,
            inputs.client_id,
            Some(address),
            report,
        ));
    }

    for address in inputs.connection.target_addresses() {
        if inputs.targets.contains_key(&address) {
            continue;
        }
        statuses.push(record(
            ResourceType::Target,
            inputs.client_id,
            Some(address),
            missing(inputs.connected, "no message published yet"),
        ));
    }
    for (address, report) in inputs.targets {
        statuses.push(record(
            ResourceType::Target,
            inputs.client_id,
            Some(address),
            report,
        ));
    }

    statuses
}

fn missing(connected: bool, details: &str) -> StatusReport {
    if connected {
        StatusReport::new(ConnectivityStatus::Unknown, Some(details.to_string()))
    } else {
        StatusReport::new(ConnectivityStatus::Closed, None)
    }
}

fn record(
    resource_type: ResourceType,
    client_id: &str,
    address: Option<String>,
    report: StatusReport,
) -> ResourceStatus {
    ResourceStatus {
        resource_type,
        client_id: client_id.to_string(),
        address,
        status: report.status,
        status_details: report.details,
        in_state_since: report.since,
    }
}
