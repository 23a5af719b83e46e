/*
 * Copyright 2024 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use meshgate::{
    cluster::ClusterHostUpdater,
    host::{HealthStatus, HostSpec},
    test::echo_server,
    Config, ListenerState, Server,
};

const CONFIG: &str = "
drain_timeout: 1s
listeners:
  - name: ingress
    address: 127.0.0.1:0
    filters:
      - name: meshgate.filters.tcp_proxy.v1alpha1.TcpProxy
        config:
          cluster: backend
clusters:
  - name: backend
";

async fn expect_closed(client: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

async fn expect_echo(client: &mut TcpStream, payload: &[u8]) {
    client.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, &*buf);
}

#[tokio::test]
async fn no_healthy_host_closes_connection() {
    let config = Config::from_reader(CONFIG.as_bytes()).unwrap();
    let (mut server, _) = Server::new(&config);
    server.start().await.unwrap();
    let address = server.listener("ingress").unwrap().local_addr().unwrap();

    let mut client = TcpStream::connect(address).await.unwrap();
    expect_closed(&mut client).await;
    server.shutdown().await;
}

#[tokio::test]
async fn follows_host_updates() {
    let config = Config::from_reader(CONFIG.as_bytes()).unwrap();
    let (mut server, _) = Server::new(&config);
    server.start().await.unwrap();
    let address = server.listener("ingress").unwrap().local_addr().unwrap();

    let echo = echo_server().await;
    server
        .clusters()
        .update_cluster_host("backend", 0, vec![HostSpec::new(echo)])
        .unwrap();
    let mut client = TcpStream::connect(address).await.unwrap();
    expect_echo(&mut client, b"first").await;

    let backend = server.clusters().get_cluster_by_name("backend").unwrap();
    backend.set_host_status(&echo.into(), HealthStatus::Draining);
    let mut drained = TcpStream::connect(address).await.unwrap();
    expect_closed(&mut drained).await;

    // Established connections keep relaying.
    expect_echo(&mut client, b"second").await;
    drop(client);

    server.shutdown().await;
    assert_eq!(
        ListenerState::Closed,
        server.listener("ingress").unwrap().state()
    );
}

#[tokio::test]
async fn drain_closes_long_lived_connections() {
    let echo = echo_server().await;
    let mut config = Config::from_reader(CONFIG.as_bytes()).unwrap();
    config.drain_timeout = Duration::from_millis(200);
    config.hosts = vec![meshgate::config::ClusterHosts {
        cluster: "backend".into(),
        priority: 0,
        hosts: vec![HostSpec::new(echo)],
    }];

    let (mut server, _) = Server::new(&config);
    server.start().await.unwrap();
    let address = server.listener("ingress").unwrap().local_addr().unwrap();

    let mut client = TcpStream::connect(address).await.unwrap();
    expect_echo(&mut client, b"ping").await;

    timeout(Duration::from_secs(5), server.shutdown())
        .await
        .unwrap();
    expect_closed(&mut client).await;
}

#[tokio::test]
async fn relays_bulk_data_to_a_late_reader() {
    const PAYLOAD: usize = 16 * 1024 * 1024;

    let echo = echo_server().await;
    let mut config = Config::from_reader(CONFIG.as_bytes()).unwrap();
    config.hosts = vec![meshgate::config::ClusterHosts {
        cluster: "backend".into(),
        priority: 0,
        hosts: vec![HostSpec::new(echo)],
    }];

    let (mut server, _) = Server::new(&config);
    server.start().await.unwrap();
    let address = server.listener("ingress").unwrap().local_addr().unwrap();

    let (mut reader, mut writer) = TcpStream::connect(address).await.unwrap().into_split();
    let write = tokio::spawn(async move {
        let chunk = vec![7u8; 64 * 1024];
        for _ in 0..PAYLOAD / chunk.len() {
            writer.write_all(&chunk).await.unwrap();
        }
        writer.shutdown().await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut received = Vec::with_capacity(PAYLOAD);
    timeout(Duration::from_secs(20), reader.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    write.await.unwrap();

    assert_eq!(PAYLOAD, received.len());
    assert!(received.iter().all(|byte| *byte == 7));
    server.shutdown().await;
}
