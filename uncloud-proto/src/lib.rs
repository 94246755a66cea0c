pub mod v1 {
    tonic::include_proto!("uncloud.v1");
}

use tonic::Status;

use v1::{Metadata, RpcStatus};

impl From<&Status> for RpcStatus {
    fn from(status: &Status) -> Self {
        RpcStatus {
            code: status.code() as i32,
            message: status.message().to_string(),
        }
    }
}

impl Metadata {
    /// Metadata for a successful response produced by `machine`.
    pub fn for_machine(machine: &str) -> Self {
        Metadata {
            machine: machine.to_string(),
            status: None,
        }
    }

    /// Metadata for a failed fan-out branch: the address of the backend that
    /// was asked, plus the status it (or its transport) produced.
    pub fn error(machine: &str, status: &Status) -> Self {
        Metadata {
            machine: machine.to_string(),
            status: Some(RpcStatus::from(status)),
        }
    }
}

/// Response messages that carry an envelope `Metadata` field.
pub trait WithMetadata {
    fn metadata_mut(&mut self) -> &mut Option<Metadata>;
    fn metadata(&self) -> Option<&Metadata>;
}

macro_rules! impl_with_metadata {
    ($($ty:ty),* $(,)?) => {
        $(
            impl WithMetadata for $ty {
                fn metadata_mut(&mut self) -> &mut Option<Metadata> {
                    &mut self.metadata
                }

                fn metadata(&self) -> Option<&Metadata> {
                    self.metadata.as_ref()
                }
            }
        )*
    };
}

impl_with_metadata!(
    v1::Empty,
    v1::CheckPrerequisitesResponse,
    v1::InitClusterResponse,
    v1::JoinClusterResponse,
    v1::TokenResponse,
    v1::InspectResponse,
    v1::ResetResponse,
    v1::InspectServiceResponse,
    v1::AddMachineResponse,
    v1::ListMachinesResponse,
    v1::UpdateMachineResponse,
    v1::RemoveMachineResponse,
);

/// Stamps (or re-stamps) the producing machine's address onto a response,
/// preserving any failure status already recorded in the envelope.
pub fn stamp<T: WithMetadata>(mut response: T, machine: &str) -> T {
    let metadata = response.metadata_mut().get_or_insert_with(Metadata::default);
    metadata.machine = machine.to_string();
    response
}
