use std::sync::Arc;

use tonic::{Request, Response, Status};

use uncloud_proto::v1 as pb;
use uncloud_proto::v1::cluster_client::ClusterClient;
use uncloud_proto::v1::cluster_server::Cluster;

use crate::backend::Backend;
use crate::daemon::Daemon;
use crate::director::Route;
use crate::proxy::{self, ResponseStream};

/// Cluster membership API. All methods stream their response envelopes so a
/// fan-out over N machines yields exactly N messages, in request order, with
/// per-branch failures recorded in each envelope's metadata rather than
/// failing the call.
#[derive(Clone)]
pub struct ClusterService {
    daemon: Arc<Daemon>,
}

impl ClusterService {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        ClusterService { daemon }
    }
}

#[tonic::async_trait]
impl Cluster for ClusterService {
    type AddMachineStream = ResponseStream<pb::AddMachineResponse>;

    async fn add_machine(
        &self,
        request: Request<pb::AddMachineRequest>,
    ) -> Result<Response<Self::AddMachineStream>, Status> {
        let (metadata, _, message) = request.into_parts();
        let broadcast = !proxy::is_forwarded(&metadata);
        let authority = self.daemon.director().local_address();
        match self.daemon.director().route(&metadata)? {
            Route::One2One(backend) if backend.is_local() => {
                let response = self.daemon.add_machine_local(message, broadcast).await?;
                Ok(Response::new(proxy::single(Ok(response))))
            }
            Route::One2One(backend) => {
                let response = call_add(backend, message, &authority).await?;
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
                            daemon.add_machine_local(message, false).await
                        } else {
                            call_add(backend, message, &authority).await
                        }
                    }
                })
                .await;
                Ok(Response::new(stream))
            }
        }
    }

    type ListMachinesStream = ResponseStream<pb::ListMachinesResponse>;

    async fn list_machines(
        &self,
        request: Request<pb::ListMachinesRequest>,
    ) -> Result<Response<Self::ListMachinesStream>, Status> {
        let (metadata, _, message) = request.into_parts();
        let authority = self.daemon.director().local_address();
        match self.daemon.director().route(&metadata)? {
            Route::One2One(backend) if backend.is_local() => {
                let response = self.daemon.list_machines_local()?;
                Ok(Response::new(proxy::single(Ok(response))))
            }
            Route::One2One(backend) => {
                let response = call_list(backend, message, &authority).await?;
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
                            daemon.list_machines_local()
                        } else {
                            call_list(backend, message, &authority).await
                        }
                    }
                })
                .await;
                Ok(Response::new(stream))
            }
        }
    }

    type UpdateMachineStream = ResponseStream<pb::UpdateMachineResponse>;

    async fn update_machine(
        &self,
        request: Request<pb::UpdateMachineRequest>,
    ) -> Result<Response<Self::UpdateMachineStream>, Status> {
        let (metadata, _, message) = request.into_parts();
        let broadcast = !proxy::is_forwarded(&metadata);
        let authority = self.daemon.director().local_address();
        match self.daemon.director().route(&metadata)? {
            Route::One2One(backend) if backend.is_local() => {
                let response = self.daemon.update_machine_local(message, broadcast).await?;
                Ok(Response::new(proxy::single(Ok(response))))
            }
            Route::One2One(backend) => {
                let response = call_update(backend, message, &authority).await?;
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
                            daemon.update_machine_local(message, false).await
                        } else {
                            call_update(backend, message, &authority).await
                        }
                    }
                })
                .await;
                Ok(Response::new(stream))
            }
        }
    }

    type RemoveMachineStream = ResponseStream<pb::RemoveMachineResponse>;

    async fn remove_machine(
        &self,
        request: Request<pb::RemoveMachineRequest>,
    ) -> Result<Response<Self::RemoveMachineStream>, Status> {
        let (metadata, _, message) = request.into_parts();
        let broadcast = !proxy::is_forwarded(&metadata);
        let authority = self.daemon.director().local_address();
        match self.daemon.director().route(&metadata)? {
            Route::One2One(backend) if backend.is_local() => {
                let response = self.daemon.remove_machine_local(message, broadcast).await?;
                Ok(Response::new(proxy::single(Ok(response))))
            }
            Route::One2One(backend) => {
                let response = call_remove(backend, message, &authority).await?;
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
                            daemon.remove_machine_local(message, false).await
                        } else {
                            call_remove(backend, message, &authority).await
                        }
                    }
                })
                .await;
                Ok(Response::new(stream))
            }
        }
    }
}

async fn call_add(
    backend: Backend,
    message: pb::AddMachineRequest,
    authority: &str,
) -> Result<pb::AddMachineResponse, Status> {
    let mut client = ClusterClient::new(backend.channel());
    let mut stream = client
        .add_machine(proxy::forward(message, authority))
        .await
        .map_err(proxy::normalize_transport_status)?
        .into_inner();
    first_message(&mut stream).await
}

async fn call_list(
    backend: Backend,
    message: pb::ListMachinesRequest,
    authority: &str,
) -> Result<pb::ListMachinesResponse, Status> {
    let mut client = ClusterClient::new(backend.channel());
    let mut stream = client
        .list_machines(proxy::forward(message, authority))
        .await
        .map_err(proxy::normalize_transport_status)?
        .into_inner();
    first_message(&mut stream).await
}

async fn call_update(
    backend: Backend,
    message: pb::UpdateMachineRequest,
    authority: &str,
) -> Result<pb::UpdateMachineResponse, Status> {
    let mut client = ClusterClient::new(backend.channel());
    let mut stream = client
        .update_machine(proxy::forward(message, authority))
        .await
        .map_err(proxy::normalize_transport_status)?
        .into_inner();
    first_message(&mut stream).await
}

async fn call_remove(
    backend: Backend,
    message: pb::RemoveMachineRequest,
    authority: &str,
) -> Result<pb::RemoveMachineResponse, Status> {
    let mut client = ClusterClient::new(backend.channel());
    let mut stream = client
        .remove_machine(proxy::forward(message, authority))
        .await
        .map_err(proxy::normalize_transport_status)?
        .into_inner();
    first_message(&mut stream).await
}

async fn first_message<T>(stream: &mut tonic::Streaming<T>) -> Result<T, Status> {
    stream
        .message()
        .await?
        .ok_or_else(|| Status::internal("peer returned no response"))
}
