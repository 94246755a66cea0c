use std::sync::Arc;

use tonic::{Request, Response, Status};

use uncloud_proto::v1 as pb;
use uncloud_proto::v1::machine_client::MachineClient;
use uncloud_proto::v1::machine_server::Machine;
use uncloud_proto::v1::Metadata;

use crate::backend::Backend;
use crate::daemon::Daemon;
use crate::director::Route;
use crate::proxy::{self, ResponseStream};

/// Machine lifecycle API. Calls that mutate the local machine's identity
/// (init, join, token, reset) must terminate on the machine they were sent
/// to; the read-only calls may be forwarded one-to-one, and InspectService
/// fans out.
#[derive(Clone)]
pub struct MachineService {
    daemon: Arc<Daemon>,
}

impl MachineService {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        MachineService { daemon }
    }

    fn local_metadata(&self) -> Option<Metadata> {
        Some(Metadata::for_machine(
            &self.daemon.director().local_address(),
        ))
    }
}

fn require_local(route: &Route) -> Result<(), Status> {
    match route {
        Route::One2One(backend) if backend.is_local() => Ok(()),
        _ => Err(Status::invalid_argument(
            "this call must be addressed to the local machine",
        )),
    }
}

#[tonic::async_trait]
impl Machine for MachineService {
    async fn check_prerequisites(
        &self,
        request: Request<pb::CheckPrerequisitesRequest>,
    ) -> Result<Response<pb::CheckPrerequisitesResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        match self.daemon.director().route(&metadata)? {
            Route::One2One(backend) if backend.is_local() => {
                let (satisfied, details) = self.daemon.check_prerequisites();
                Ok(Response::new(pb::CheckPrerequisitesResponse {
                    metadata: self.local_metadata(),
                    satisfied,
                    details,
                }))
            }
            Route::One2One(backend) => {
                let authority = self.daemon.director().local_address();
                let mut client = MachineClient::new(backend.channel());
                let response = client
                    .check_prerequisites(proxy::forward(message, &authority))
                    .await
                    .map_err(proxy::normalize_transport_status)?;
                Ok(Response::new(response.into_inner()))
            }
            Route::One2Many(_) => Err(Status::invalid_argument(
                "cannot fan out a unary call",
            )),
        }
    }

    async fn init_cluster(
        &self,
        request: Request<pb::InitClusterRequest>,
    ) -> Result<Response<pb::InitClusterResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        require_local(&self.daemon.director().route(&metadata)?)?;
        let record = self.daemon.clone().init_cluster(message).await?;
        Ok(Response::new(pb::InitClusterResponse {
            metadata: self.local_metadata(),
            machine: Some((&record).into()),
        }))
    }

    async fn join_cluster(
        &self,
        request: Request<pb::JoinClusterRequest>,
    ) -> Result<Response<pb::JoinClusterResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        require_local(&self.daemon.director().route(&metadata)?)?;
        self.daemon.clone().join_cluster(message).await?;
        Ok(Response::new(pb::JoinClusterResponse {
            metadata: self.local_metadata(),
        }))
    }

    async fn token(
        &self,
        request: Request<pb::TokenRequest>,
    ) -> Result<Response<pb::TokenResponse>, Status> {
        require_local(&self.daemon.director().route(request.metadata())?)?;
        let token = self.daemon.token().await?;
        Ok(Response::new(pb::TokenResponse {
            metadata: self.local_metadata(),
            token,
        }))
    }

    async fn inspect(
        &self,
        request: Request<pb::InspectRequest>,
    ) -> Result<Response<pb::InspectResponse>, Status> {
        let (metadata, _, message) = request.into_parts();
        match self.daemon.director().route(&metadata)? {
            Route::One2One(backend) if backend.is_local() => {
                let (record, state) = self.daemon.inspect()?;
                Ok(Response::new(pb::InspectResponse {
                    metadata: self.local_metadata(),
                    machine: Some((&record).into()),
                    state: pb::MembershipState::from(state) as i32,
                }))
            }
            Route::One2One(backend) => {
                let authority = self.daemon.director().local_address();
                let mut client = MachineClient::new(backend.channel());
                let response = client
                    .inspect(proxy::forward(message, &authority))
                    .await
                    .map_err(proxy::normalize_transport_status)?;
                Ok(Response::new(response.into_inner()))
            }
            Route::One2Many(_) => Err(Status::invalid_argument(
                "cannot fan out a unary call",
            )),
        }
    }

    async fn reset(
        &self,
        request: Request<pb::ResetRequest>,
    ) -> Result<Response<pb::ResetResponse>, Status> {
        require_local(&self.daemon.director().route(request.metadata())?)?;
        self.daemon.reset().await?;
        Ok(Response::new(pb::ResetResponse {
            metadata: self.local_metadata(),
        }))
    }

    type InspectServiceStream = ResponseStream<pb::InspectServiceResponse>;

    async fn inspect_service(
        &self,
        request: Request<pb::InspectServiceRequest>,
    ) -> Result<Response<Self::InspectServiceStream>, Status> {
        let (metadata, _, message) = request.into_parts();
        let authority = self.daemon.director().local_address();
        match self.daemon.director().route(&metadata)? {
            Route::One2One(backend) if backend.is_local() => {
                let response = self.daemon.inspect_service_local(&message.id)?;
                Ok(Response::new(proxy::single(Ok(response))))
            }
            Route::One2One(backend) => {
                let response = call_inspect_service(backend, message, &authority).await?;
                Ok(Response::new(proxy::single(Ok(response))))
            }
            Route::One2Many(backends) => {
                let daemon = self.daemon.clone();
                let stream = proxy::fan_out(backends, move |backend| {
                    let daemon = daemon.clone();
                    let message = message.clone();
                    let authority = authority.clone();
                    async move {
                        if backend.is_local() {
                            daemon.inspect_service_local(&message.id)
                        } else {
                            call_inspect_service(backend, message, &authority).await
                        }
                    }
                })
                .await;
                Ok(Response::new(stream))
            }
        }
    }
}

async fn call_inspect_service(
    backend: Backend,
    message: pb::InspectServiceRequest,
    authority: &str,
) -> Result<pb::InspectServiceResponse, Status> {
    let mut client = MachineClient::new(backend.channel());
    let mut stream = client
        .inspect_service(proxy::forward(message, authority))
        .await
        .map_err(proxy::normalize_transport_status)?
        .into_inner();
    stream
        .message()
        .await?
        .ok_or_else(|| Status::internal("peer returned no response"))
}
