use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_socks::tcp::Socks5Stream;
use tracing::{info, trace, warn};
use crate::config::SocksUdpGwConfig;
use crate::udpgw::client::{UdpGwClient, UdpGwHandler};

/// Keeps a [UdpGwClient] connected to a udpgw server through a SOCKS5 proxy, reconnecting after
///  a delay whenever the connection fails. Packets submitted while there is no connection are
///  dropped.
pub struct SocksUdpGwClient {
    config: SocksUdpGwConfig,
    current: Arc<Mutex<Option<UdpGwClient>>>,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl SocksUdpGwClient {
    pub fn new(config: SocksUdpGwConfig, handler: Arc<dyn UdpGwHandler>) -> anyhow::Result<SocksUdpGwClient> {
        config.validate()?;

        let current = Arc::new(Mutex::new(None));
        let (connected_tx, connected) = watch::channel(false);
        let task = tokio::spawn(Self::run(config.clone(), handler, current.clone(), connected_tx));

        Ok(SocksUdpGwClient {
            config,
            current,
            connected,
            task,
        })
    }

    pub fn udp_mtu(&self) -> usize {
        self.config.client.udp_mtu
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// follow connection state changes
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn submit_packet(&self, local: SocketAddr, remote: SocketAddr, is_dns: bool, payload: &[u8]) {
        match &*self.current.lock().unwrap() {
            Some(client) => client.submit_packet(local, remote, is_dns, payload),
            None => trace!("not connected to udpgw server - dropping packet"),
        }
    }

    async fn run(config: SocksUdpGwConfig, handler: Arc<dyn UdpGwHandler>, current: Arc<Mutex<Option<UdpGwClient>>>, connected: watch::Sender<bool>) {
        loop {
            match Self::connect(&config).await {
                Ok(stream) => match UdpGwClient::new(config.client.clone(), stream, handler.clone()) {
                    Ok((client, error)) => {
                        info!("connected to udpgw server {:?} through SOCKS server {:?}", config.udpgw_server_addr, config.socks_server_addr);
                        *current.lock().unwrap() = Some(client);
                        connected.send_replace(true);

                        if let Ok(e) = error.await {
                            warn!("udpgw connection lost: {}", e);
                        }

                        let client = current.lock().unwrap().take();
                        drop(client);
                        connected.send_replace(false);
                    }
                    Err(e) => warn!("error starting udpgw client: {}", e),
                },
                Err(e) => warn!("error connecting to udpgw server {:?} through SOCKS server {:?}: {}", config.udpgw_server_addr, config.socks_server_addr, e),
            }

            trace!("reconnecting in {:?}", config.reconnect_time);
            tokio::time::sleep(config.reconnect_time).await;
        }
    }

    async fn connect(config: &SocksUdpGwConfig) -> anyhow::Result<TcpStream> {
        let stream = match &config.socks_auth {
            None => Socks5Stream::connect(config.socks_server_addr, config.udpgw_server_addr).await?,
            Some(auth) => Socks5Stream::connect_with_password(config.socks_server_addr, config.udpgw_server_addr, &auth.username, &auth.password).await?,
        };

        let stream = stream.into_inner();
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl Drop for SocksUdpGwClient {
    fn drop(&mut self) {
        self.task.abort();
        let client = self.current.lock().unwrap().take();
        drop(client);
    }
}
