//! TCP front door: accepts RESP connections, routes data commands
//! through the store and the durability log, and hands replication
//! traffic to the coordinator.

use crate::config::ServerConfig;
use crate::core::{commands, ConnCtx, Reply, Store};
use crate::persistence::{recovery, CommandLog, Compactor};
use crate::replication::{
    parse_host_port, BacklogFeed, PrimaryCoordinator, ReplicaClient, ReplicaConnInfo,
};
use crate::protocol::resp::RespReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

pub struct Server {
    config: ServerConfig,
    store: Arc<Store>,
    log: Arc<CommandLog>,
    compactor: Arc<Compactor>,
    coordinator: Arc<PrimaryCoordinator>,
    replica: Arc<ReplicaClient>,
    /// Held across execute + enqueue for write commands, so the log
    /// records writes in exactly the order the store accepted them
    write_order: tokio::sync::Mutex<()>,
}

impl Server {
    /// Recover the dataset, open the log, and wire both replication
    /// roles. Listening starts separately via [`Server::run`].
    pub async fn new(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        config.validate()?;

        let store = Arc::new(Store::new(config.server.databases));
        if config.durability.enabled {
            recovery::load_command_log(&config.durability.log_path, &store).await?;
        }

        let log = CommandLog::open(config.durability.clone()).await?;
        let compactor = Arc::new(Compactor::new(Arc::clone(&log), store.db_count()));

        let snapshot_path = config.durability.log_path.with_extension("snapshot");
        let coordinator = PrimaryCoordinator::new(
            config.replication.clone(),
            Arc::clone(&compactor),
            snapshot_path,
        );
        log.listeners()
            .add(Arc::new(BacklogFeed(Arc::clone(&coordinator))));
        coordinator.start();

        let replica = ReplicaClient::new(
            Arc::clone(&store),
            Arc::clone(&log),
            Arc::clone(&compactor),
            config.replication.clone(),
            config.server.port,
        );
        if let Some(target) = &config.replication.replica_of {
            let (host, port) = parse_host_port(target).map_err(anyhow::Error::msg)?;
            replica.set_primary(host, port);
        }

        Ok(Arc::new(Self {
            config,
            store,
            log,
            compactor,
            coordinator,
            replica,
            write_order: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind((
            self.config.server.host.as_str(),
            self.config.server.port,
        ))
        .await?;
        info!(addr = %listener.local_addr()?, "listening");
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, addr).await {
                    debug!(%addr, "connection ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> anyhow::Result<()> {
        stream.set_nodelay(true).ok();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = RespReader::new(read_half);
        let mut ctx = ConnCtx::client();
        let mut conn_info = ReplicaConnInfo::default();
        let mut authenticated = self.config.replication.primary_auth.is_none();

        loop {
            let Some((args, _)) = reader.read_command().await? else {
                return Ok(());
            };
            if args.is_empty() {
                continue;
            }
            let name = args[0].to_ascii_uppercase();

            if name == b"AUTH" {
                authenticated = self.check_auth(&args, &mut writer).await?;
                continue;
            }
            if !authenticated {
                reply(&mut writer, Reply::Error("NOAUTH Authentication required.".into()))
                    .await?;
                continue;
            }

            match name.as_slice() {
                b"REPLCONF" => {
                    collect_replconf(&mut conn_info, &args);
                    reply(&mut writer, Reply::Simple("OK".into())).await?;
                }
                b"PSYNC" => {
                    return self
                        .handle_psync(reader, writer, addr, conn_info, &args)
                        .await;
                }
                b"REPLICAOF" | b"SLAVEOF" => {
                    let r = self.handle_replicaof(&args);
                    reply(&mut writer, r).await?;
                }
                b"BGREWRITEAOF" => {
                    let compactor = Arc::clone(&self.compactor);
                    tokio::spawn(async move {
                        if let Err(e) = compactor.rewrite(None).await {
                            error!("background rewrite failed: {e}");
                        }
                    });
                    reply(&mut writer, Reply::Simple("OK".into())).await?;
                }
                b"INFO" => {
                    reply(&mut writer, Reply::Bulk(self.info_text().into_bytes())).await?;
                }
                _ => {
                    let r = if commands::is_write_command(&String::from_utf8_lossy(&name)) {
                        // One critical section: a concurrent write can
                        // neither execute nor enqueue between our two
                        // steps, so log order equals acceptance order.
                        let _order = self.write_order.lock().await;
                        let exec = self.store.execute(&mut ctx, &args);
                        for write in exec.writes {
                            self.log.enqueue(ctx.db_index, write).await?;
                        }
                        exec.reply
                    } else {
                        self.store.execute(&mut ctx, &args).reply
                    };
                    reply(&mut writer, r).await?;
                }
            }
        }
    }

    async fn check_auth(
        &self,
        args: &[Vec<u8>],
        writer: &mut OwnedWriteHalf,
    ) -> anyhow::Result<bool> {
        let Some(expected) = &self.config.replication.primary_auth else {
            reply(
                writer,
                Reply::Error("ERR Client sent AUTH, but no password is set".into()),
            )
            .await?;
            return Ok(true);
        };
        if args.len() == 2 && args[1] == expected.as_bytes() {
            reply(writer, Reply::Simple("OK".into())).await?;
            Ok(true)
        } else {
            reply(writer, Reply::Error("ERR invalid password".into())).await?;
            Ok(false)
        }
    }

    /// PSYNC hands the whole connection over to the coordinator; this
    /// function returning ends the request loop for good.
    async fn handle_psync(
        self: Arc<Self>,
        reader: RespReader<tokio::net::tcp::OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        addr: SocketAddr,
        conn_info: ReplicaConnInfo,
        args: &[Vec<u8>],
    ) -> anyhow::Result<()> {
        if !self.log.is_enabled() {
            reply(
                &mut writer,
                Reply::Error("ERR PSYNC requires the durability log to be enabled".into()),
            )
            .await?;
            return Ok(());
        }
        let parsed = match args {
            [_, id, offset] => String::from_utf8_lossy(offset)
                .parse::<i64>()
                .ok()
                .map(|o| (String::from_utf8_lossy(id).into_owned(), o)),
            _ => None,
        };
        let Some((requested_id, requested_offset)) = parsed else {
            reply(
                &mut writer,
                Reply::Error("ERR wrong number of arguments for 'psync' command".into()),
            )
            .await?;
            return Ok(());
        };

        self.coordinator
            .accept_replica(reader, writer, addr, conn_info, requested_id, requested_offset)
            .await;
        Ok(())
    }

    fn handle_replicaof(&self, args: &[Vec<u8>]) -> Reply {
        if args.len() != 3 {
            return Reply::Error("ERR wrong number of arguments for 'replicaof' command".into());
        }
        let host = String::from_utf8_lossy(&args[1]).into_owned();
        let port_text = String::from_utf8_lossy(&args[2]);

        if host.eq_ignore_ascii_case("no") && port_text.eq_ignore_ascii_case("one") {
            self.replica.clear_primary();
            return Reply::Simple("OK".into());
        }
        match port_text.parse::<u16>() {
            Ok(port) => {
                self.replica.set_primary(host, port);
                Reply::Simple("OK".into())
            }
            Err(_) => Reply::Error("ERR Invalid master port".into()),
        }
    }

    fn info_text(&self) -> String {
        let role = if self.replica.is_replica() {
            "replica"
        } else {
            "primary"
        };
        let mut out = format!("# Server\r\nrole:{role}\r\n");

        out.push_str("\r\n# Replication\r\n");
        out.push_str(&self.coordinator.info());
        if self.replica.is_replica() {
            out.push_str(&self.replica.info());
        }

        out.push_str("\r\n# Keyspace\r\n");
        for db_index in 0..self.store.db_count() {
            let (keys, ttls) = self.store.key_count(db_index);
            if keys > 0 {
                out.push_str(&format!("db{db_index}:keys={keys},expires={ttls}\r\n"));
            }
        }
        out
    }
}

fn collect_replconf(info: &mut ReplicaConnInfo, args: &[Vec<u8>]) {
    let mut pairs = args[1..].chunks_exact(2);
    for pair in &mut pairs {
        let option = pair[0].to_ascii_lowercase();
        let value = String::from_utf8_lossy(&pair[1]).into_owned();
        match option.as_slice() {
            b"listening-port" => info.listening_port = value.parse().ok(),
            b"ip-address" => info.announced_ip = Some(value),
            b"capa" => info.capabilities.push(value),
            _ => {}
        }
    }
}

async fn reply(writer: &mut OwnedWriteHalf, reply: Reply) -> anyhow::Result<()> {
    writer.write_all(&reply.encode()).await?;
    Ok(())
}
