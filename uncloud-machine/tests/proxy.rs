//! End-to-end tests of the request routing layer: three machines on
//! loopback addresses, one of them never started, exercised through the
//! same gRPC surface an operator uses. Overlay management is disabled so
//! the tests run without WireGuard or root.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UnixStream};
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};
use tonic::{Code, Request};
use tower::service_fn;

use uncloud_machine::{Daemon, DaemonOptions, TokenInfo};
use uncloud_proto::v1 as pb;
use uncloud_proto::v1::cluster_client::ClusterClient;
use uncloud_proto::v1::machine_client::MachineClient;

const MACHINES_KEY: &str = "machines";
const PROXY_AUTHORITY_KEY: &str = "proxy-authority";

async fn start_daemon(
    dir: &tempfile::TempDir,
    name: &str,
    advertise: IpAddr,
    api_port: u16,
) -> (Arc<Daemon>, Channel) {
    let socket_path = dir.path().join(format!("{name}.sock"));
    let daemon = Arc::new(
        Daemon::new(DaemonOptions {
            config_path: dir.path().join(format!("{name}.toml")),
            socket_path: socket_path.clone(),
            advertise_address: Some(advertise),
            api_port,
            manage_network: false,
            ..Default::default()
        })
        .unwrap(),
    );
    tokio::spawn(daemon.clone().serve());
    wait_for_socket(&socket_path).await;
    (daemon, uds_channel(socket_path))
}

fn uds_channel(path: PathBuf) -> Channel {
    TonicEndpoint::from_static("http://uncloud")
        .connect_with_connector_lazy(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
}

async fn wait_for_socket(path: &std::path::Path) {
    for _ in 0..100 {
        if path.exists() {
            // The listener is bound before the file appears; give the
            // accept loop a beat.
            tokio::time::sleep(Duration::from_millis(20)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon socket {} never appeared", path.display());
}

async fn wait_for_tcp(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("management API at {addr} never came up");
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn machines_request<T>(message: T, machines: &[&str]) -> Request<T> {
    let mut request = Request::new(message);
    for machine in machines {
        request
            .metadata_mut()
            .append(MACHINES_KEY, MetadataValue::try_from(*machine).unwrap());
    }
    request
}

async fn collect<T>(mut stream: tonic::Streaming<T>) -> Vec<T> {
    let mut envelopes = Vec::new();
    while let Some(envelope) = stream.message().await.unwrap() {
        envelopes.push(envelope);
    }
    envelopes
}

fn machine_names(response: &pb::ListMachinesResponse) -> Vec<String> {
    response
        .machines
        .iter()
        .filter_map(|member| member.machine.as_ref())
        .map(|machine| machine.name.clone())
        .collect()
}

#[tokio::test]
async fn fan_out_routes_across_a_two_machine_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let m1_addr: IpAddr = "127.0.0.1".parse().unwrap();
    let m2_addr: IpAddr = "127.0.0.2".parse().unwrap();

    let (_d1, uds1) = start_daemon(&dir, "m1", m1_addr, port).await;
    let (_d2, uds2) = start_daemon(&dir, "m2", m2_addr, port).await;
    let mut machine1 = MachineClient::new(uds1.clone());
    let mut cluster1 = ClusterClient::new(uds1);
    let mut machine2 = MachineClient::new(uds2.clone());
    let mut cluster2 = ClusterClient::new(uds2);

    // Initialize the cluster on m1: first /24 of the cluster network, with
    // the first host as management IP.
    let init = machine1
        .init_cluster(pb::InitClusterRequest {
            machine_name: "m1".to_string(),
            network: "10.210.0.0/16".to_string(),
            public_ip: None,
        })
        .await
        .unwrap()
        .into_inner();
    let m1_info = init.machine.unwrap();
    let m1_network = m1_info.network.clone().unwrap();
    assert_eq!(m1_network.subnet, "10.210.0.0/24");
    assert_eq!(m1_network.management_ip, "10.210.0.1");

    let roster = collect(
        cluster1
            .list_machines(pb::ListMachinesRequest {})
            .await
            .unwrap()
            .into_inner(),
    )
    .await;
    assert_eq!(roster.len(), 1);
    assert_eq!(machine_names(&roster[0]), vec!["m1".to_string()]);
    assert_eq!(
        roster[0].machines[0].state,
        pb::MembershipState::Up as i32
    );

    // Admit m2: ask it for its token, register it on the cluster, then hand
    // it the assigned identity and the current roster.
    let token = machine2
        .token(pb::TokenRequest {})
        .await
        .unwrap()
        .into_inner()
        .token;
    let token = TokenInfo::decode(&token).unwrap();

    let added = collect(
        cluster1
            .add_machine(pb::AddMachineRequest {
                name: "m2".to_string(),
                public_key: token.public_key,
                endpoints: vec!["203.0.113.2:51820".to_string()],
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner(),
    )
    .await;
    assert_eq!(added.len(), 1);
    let m2_info = added[0].machine.clone().unwrap();
    assert_eq!(m2_info.network.as_ref().unwrap().subnet, "10.210.1.0/24");
    assert_eq!(
        m2_info.network.as_ref().unwrap().management_ip,
        "10.210.1.1"
    );

    machine2
        .join_cluster(pb::JoinClusterRequest {
            machine: Some(m2_info),
            other_machines: vec![m1_info],
            network: "10.210.0.0/16".to_string(),
        })
        .await
        .unwrap();
    wait_for_tcp(SocketAddr::new(m2_addr, port)).await;

    let both = collect(
        cluster2
            .list_machines(pb::ListMachinesRequest {})
            .await
            .unwrap()
            .into_inner(),
    )
    .await;
    let mut names = machine_names(&both[0]);
    names.sort();
    assert_eq!(names, vec!["m1".to_string(), "m2".to_string()]);

    // Fan out from m1 to itself, m2, and a machine that is powered off:
    // exactly three envelopes, in request order, the dead branch carrying
    // its failure in-band.
    let envelopes = collect(
        cluster1
            .list_machines(machines_request(
                pb::ListMachinesRequest {},
                &["127.0.0.1", "127.0.0.2", "127.0.0.3"],
            ))
            .await
            .unwrap()
            .into_inner(),
    )
    .await;
    assert_eq!(envelopes.len(), 3);

    let produced: Vec<String> = envelopes
        .iter()
        .map(|envelope| envelope.metadata.as_ref().unwrap().machine.clone())
        .collect();
    assert_eq!(produced, vec!["127.0.0.1", "127.0.0.2", "127.0.0.3"]);

    assert!(envelopes[0].metadata.as_ref().unwrap().status.is_none());
    assert!(envelopes[1].metadata.as_ref().unwrap().status.is_none());
    let failure = envelopes[2]
        .metadata
        .as_ref()
        .unwrap()
        .status
        .as_ref()
        .expect("dead machine must report a status");
    assert_eq!(failure.code, Code::Unavailable as i32);
    assert!(envelopes[2].machines.is_empty());

    // The two live rosters are identical.
    let mut first = machine_names(&envelopes[0]);
    let mut second = machine_names(&envelopes[1]);
    first.sort();
    second.sort();
    assert_eq!(first, second);

    // One remote address routes One2One and the peer stamps its own
    // envelope.
    let remote = collect(
        cluster1
            .list_machines(machines_request(pb::ListMachinesRequest {}, &["127.0.0.2"]))
            .await
            .unwrap()
            .into_inner(),
    )
    .await;
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].metadata.as_ref().unwrap().machine, "127.0.0.2");

    // A forwarded call terminates locally even when the metadata still
    // names another machine.
    let mut forwarded = machines_request(pb::ListMachinesRequest {}, &["127.0.0.2"]);
    forwarded
        .metadata_mut()
        .insert(PROXY_AUTHORITY_KEY, MetadataValue::from_static("client"));
    let local = collect(
        cluster1
            .list_machines(forwarded)
            .await
            .unwrap()
            .into_inner(),
    )
    .await;
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].metadata.as_ref().unwrap().machine, "127.0.0.1");
}

#[tokio::test]
async fn director_input_errors_and_lifecycle_guards() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let addr: IpAddr = "127.0.0.11".parse().unwrap();

    let (_daemon, uds) = start_daemon(&dir, "solo", addr, port).await;
    let mut machine = MachineClient::new(uds.clone());
    let mut cluster = ClusterClient::new(uds);

    // Before init, the roster does not exist.
    let status = machine
        .inspect(pb::InspectRequest {})
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    machine
        .init_cluster(pb::InitClusterRequest {
            machine_name: "solo".to_string(),
            network: String::new(),
            public_ip: None,
        })
        .await
        .unwrap();

    // The default cluster network applies when none is given.
    let inspected = machine
        .inspect(pb::InspectRequest {})
        .await
        .unwrap()
        .into_inner();
    let network = inspected.machine.unwrap().network.unwrap();
    assert_eq!(network.subnet, "10.210.0.0/24");

    // Initializing twice is a lifecycle error.
    let status = machine
        .init_cluster(pb::InitClusterRequest {
            machine_name: "solo".to_string(),
            network: String::new(),
            public_ip: None,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::AlreadyExists);

    // machines metadata that is present but empty is an input error.
    let status = collect_error(
        cluster
            .list_machines(machines_request(pb::ListMachinesRequest {}, &[""]))
            .await,
    );
    assert_eq!(status.code(), Code::InvalidArgument);

    // Lifecycle calls cannot be redirected at other machines.
    let status = machine
        .reset(machines_request(pb::ResetRequest {}, &["127.0.0.12"]))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn membership_mutations_flow_through_the_roster() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let addr: IpAddr = "127.0.0.21".parse().unwrap();

    let (_daemon, uds) = start_daemon(&dir, "root", addr, port).await;
    let mut machine = MachineClient::new(uds.clone());
    let mut cluster = ClusterClient::new(uds);

    machine
        .init_cluster(pb::InitClusterRequest {
            machine_name: "root".to_string(),
            network: "10.210.0.0/16".to_string(),
            public_ip: None,
        })
        .await
        .unwrap();

    let added = collect(
        cluster
            .add_machine(pb::AddMachineRequest {
                name: "worker".to_string(),
                public_key: "worker-key".to_string(),
                endpoints: vec!["198.51.100.7:51820".to_string()],
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner(),
    )
    .await;
    let worker = added[0].machine.clone().unwrap();
    assert_eq!(worker.network.as_ref().unwrap().subnet, "10.210.1.0/24");

    // Partial update: rename only, endpoints survive.
    let updated = collect(
        cluster
            .update_machine(pb::UpdateMachineRequest {
                machine_id: worker.id.clone(),
                name: Some("worker-renamed".to_string()),
                public_ip: None,
                endpoints: None,
            })
            .await
            .unwrap()
            .into_inner(),
    )
    .await;
    let renamed = updated[0].machine.clone().unwrap();
    assert_eq!(renamed.name, "worker-renamed");
    assert_eq!(
        renamed.network.as_ref().unwrap().endpoints,
        vec!["198.51.100.7:51820".to_string()]
    );

    // Removing an unknown machine is a NotFound, not a crash.
    let status = collect_error(
        cluster
            .remove_machine(pb::RemoveMachineRequest {
                machine_id: "no-such-machine".to_string(),
            })
            .await,
    );
    assert_eq!(status.code(), Code::NotFound);

    let removed = collect(
        cluster
            .remove_machine(pb::RemoveMachineRequest {
                machine_id: worker.id.clone(),
            })
            .await
            .unwrap()
            .into_inner(),
    )
    .await;
    assert!(removed[0].metadata.as_ref().unwrap().status.is_none());

    let roster = collect(
        cluster
            .list_machines(pb::ListMachinesRequest {})
            .await
            .unwrap()
            .into_inner(),
    )
    .await;
    assert_eq!(machine_names(&roster[0]), vec!["root".to_string()]);
}

fn collect_error<T>(
    result: Result<tonic::Response<tonic::Streaming<T>>, tonic::Status>,
) -> tonic::Status {
    match result {
        Err(status) => status,
        Ok(_) => panic!("expected an error status"),
    }
}
