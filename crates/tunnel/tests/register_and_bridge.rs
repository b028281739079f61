//! S5 end-to-end scenario: a tunnel client authenticates, registers a tcp
//! service, and an external caller's bytes are bridged through the client's
//! data connection and back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relaygate_tunnel::codec::{read_frame, write_frame};
use relaygate_tunnel::protocol::{
	ControlMessage, DataConnectionData, MessageType, ProxyRequestData, RegisterServiceRequest, ServiceType,
};
use relaygate_tunnel::repository::{InMemoryServerRepository, InMemoryServiceRepository};
use relaygate_tunnel::registry::PortRange;
use relaygate_tunnel::server::{TunnelServer, TunnelServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn send(stream: &mut TcpStream, msg: ControlMessage) {
	write_frame(stream, &msg.to_frame_bytes().unwrap()).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> ControlMessage {
	let bytes = read_frame(stream).await.unwrap();
	ControlMessage::from_frame_bytes(&bytes).unwrap()
}

#[tokio::test]
async fn s5_tunnel_register_and_bridge() {
	let mut auth_tokens = HashMap::new();
	auth_tokens.insert("client-1".to_string(), "secret-token".to_string());

	let cfg = TunnelServerConfig {
		bind_addr: "127.0.0.1:0".parse().unwrap(),
		port_range: PortRange { min: 19100, max: 19110 },
		auth_tokens,
		shutdown_deadline: Duration::from_secs(5),
	};
	let server = TunnelServer::new(cfg, Arc::new(InMemoryServiceRepository::default()), Arc::new(InMemoryServerRepository::default()));
	server.start().await.unwrap();
	let control_addr = server.local_addr().unwrap();

	let mut control_conn = TcpStream::connect(control_addr).await.unwrap();

	send(
		&mut control_conn,
		ControlMessage::new(MessageType::Auth, serde_json::json!({"clientId": "client-1", "token": "secret-token"})),
	)
	.await;
	let reply = recv(&mut control_conn).await;
	let success = reply.data.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
	assert!(success, "auth should succeed: {:?}", reply.data);

	let register_req = RegisterServiceRequest {
		name: "tcpsvc".to_string(),
		service_type: ServiceType::Tcp,
		local_address: "127.0.0.1".to_string(),
		local_port: 8080,
		remote_port: None,
		custom_domains: Vec::new(),
		sub_domain: None,
	};
	send(
		&mut control_conn,
		ControlMessage::new(MessageType::RegisterService, serde_json::json!({ "service": register_req })),
	)
	.await;
	let reply = recv(&mut control_conn).await;
	assert_eq!(reply.data.get("success").and_then(|v| v.as_bool()), Some(true));
	let remote_port = reply.data.get("remotePort").and_then(|v| v.as_u64()).expect("remotePort in reply") as u16;
	assert!((19100..=19110).contains(&remote_port));

	// External caller connects to the allocated public port and sends bytes.
	let mut external = TcpStream::connect(("127.0.0.1", remote_port)).await.unwrap();
	let external_write = tokio::spawn(async move {
		external.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 5];
		external.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");
	});

	// The client side receives a `proxy_request` on the control connection
	// carrying the issued `connectionId`, opens a fresh data connection, and
	// bridges bytes back (an echo, for this test).
	let proxy_request = recv(&mut control_conn).await;
	assert_eq!(proxy_request.kind, MessageType::ProxyRequest);
	let data: ProxyRequestData = serde_json::from_value(proxy_request.data).unwrap();
	assert!(!data.connection_id.is_empty());
	let mut data_conn = TcpStream::connect(control_addr).await.unwrap();
	send(
		&mut data_conn,
		ControlMessage::new(MessageType::DataConnection, serde_json::to_value(DataConnectionData { connection_id: data.connection_id }).unwrap()),
	)
	.await;

	let mut buf = [0u8; 5];
	data_conn.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"hello");
	data_conn.write_all(b"hello").await.unwrap();

	external_write.await.unwrap();
	server.stop().await;
}
