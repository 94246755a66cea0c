//! Helpers for the fan-out RPC proxy: the metadata keys the director
//! consumes, request forwarding, and the per-branch envelope handling of
//! one-to-many calls.

use std::{future::Future, pin::Pin};

use futures::{future, stream, Stream};
use tonic::{
    metadata::{MetadataMap, MetadataValue},
    Code, Request, Status,
};

use uncloud_proto::{stamp, v1::Metadata, WithMetadata};

use crate::backend::Backend;

/// Incoming metadata key listing the peer addresses a call fans out to.
/// Absent means local-only; values may be repeated or comma-separated.
pub const MACHINES_KEY: &str = "machines";
/// Marks a call that was forwarded from a peer and must terminate here.
pub const PROXY_AUTHORITY_KEY: &str = "proxy-authority";

pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// Extracts the requested machine addresses. `None` when the key is absent
/// (local-only call); an empty vector when it is present without a single
/// usable address.
pub fn machine_addresses(metadata: &MetadataMap) -> Result<Option<Vec<String>>, Status> {
    let mut found = false;
    let mut addresses = Vec::new();
    for value in metadata.get_all(MACHINES_KEY).iter() {
        found = true;
        let value = value
            .to_str()
            .map_err(|_| Status::invalid_argument("machines metadata is not valid ASCII"))?;
        addresses.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|address| !address.is_empty())
                .map(String::from),
        );
    }
    Ok(found.then_some(addresses))
}

pub fn is_forwarded(metadata: &MetadataMap) -> bool {
    metadata.get(PROXY_AUTHORITY_KEY).is_some()
}

/// Builds the request sent to a peer on behalf of a client: the original
/// message plus the proxy-authority marker so the peer terminates the call
/// instead of routing it further. The machines list is deliberately not
/// carried over.
pub fn forward<T>(message: T, authority: &str) -> Request<T> {
    let mut request = Request::new(message);
    let value = MetadataValue::try_from(authority)
        .unwrap_or_else(|_| MetadataValue::from_static("true"));
    request.metadata_mut().insert(PROXY_AUTHORITY_KEY, value);
    request
}

/// A failure to establish a peer's lazily-dialed connection surfaces from
/// the client as an Unknown status; at the proxy boundary that is an
/// unavailable peer.
pub fn normalize_transport_status(status: Status) -> Status {
    if status.code() == Code::Unknown
        && (status.message().contains("transport error")
            || status.message().contains("Service was not ready"))
    {
        return Status::unavailable(status.message());
    }
    status
}

/// A response stream carrying exactly one envelope.
pub fn single<T: Send + 'static>(item: Result<T, Status>) -> ResponseStream<T> {
    Box::pin(stream::iter([item]))
}

/// Dispatches a call to every backend in parallel and collects one envelope
/// per backend, in input order. Branches run to completion: a failing branch
/// contributes a default-payload envelope whose metadata records the failure
/// instead of aborting the others. Cancellation of the returned future
/// cancels all branches.
pub async fn fan_out<T, F, Fut>(backends: Vec<Backend>, call: F) -> ResponseStream<T>
where
    T: WithMetadata + Default + Send + 'static,
    F: Fn(Backend) -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    let addresses: Vec<String> = backends
        .iter()
        .map(|backend| backend.address().to_string())
        .collect();
    let results = future::join_all(backends.into_iter().map(call)).await;

    let envelopes: Vec<Result<T, Status>> = addresses
        .into_iter()
        .zip(results)
        .map(|(address, result)| {
            Ok(match result {
                Ok(response) => stamp(response, &address),
                Err(status) => {
                    log::warn!("machine {address}: {status}");
                    let mut response = T::default();
                    *response.metadata_mut() = Some(Metadata::error(&address, &status));
                    response
                }
            })
        })
        .collect();
    Box::pin(stream::iter(envelopes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_machines_key_means_local_only() {
        let metadata = MetadataMap::new();
        assert_eq!(machine_addresses(&metadata).unwrap(), None);
    }

    #[test]
    fn machines_key_collects_repeated_and_comma_separated_values() {
        let mut metadata = MetadataMap::new();
        metadata.append(MACHINES_KEY, "10.210.0.1".parse().unwrap());
        metadata.append(MACHINES_KEY, "10.210.1.1, 10.210.2.1".parse().unwrap());
        assert_eq!(
            machine_addresses(&metadata).unwrap(),
            Some(vec![
                "10.210.0.1".to_string(),
                "10.210.1.1".to_string(),
                "10.210.2.1".to_string(),
            ])
        );
    }

    #[test]
    fn present_but_empty_machines_key_yields_empty_list() {
        let mut metadata = MetadataMap::new();
        metadata.append(MACHINES_KEY, "".parse().unwrap());
        assert_eq!(machine_addresses(&metadata).unwrap(), Some(vec![]));
    }

    #[test]
    fn forwarded_requests_carry_the_authority_marker() {
        let request = forward((), "10.210.0.1");
        assert!(is_forwarded(request.metadata()));
        assert_eq!(
            request
                .metadata()
                .get(PROXY_AUTHORITY_KEY)
                .unwrap()
                .to_str()
                .unwrap(),
            "10.210.0.1"
        );
        assert!(request.metadata().get(MACHINES_KEY).is_none());
    }
}
