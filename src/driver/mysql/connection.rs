use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error};

use crate::config::DatabaseConfig;
use crate::driver::{DriverError, ExecResult, ResultSet};
use crate::protocol::{
    capabilities, compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet,
    parse_column_name, parse_text_row, read_lenenc_int, AuthSwitchRequest, Command, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket, Packet, PacketCodec, NATIVE_PASSWORD_PLUGIN,
};

/// Server status flag: another result set follows
const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;

/// Response to a COM_QUERY
#[derive(Debug)]
pub(crate) enum QueryResponse {
    Ok(OkPacket),
    Rows(ResultSet),
}

/// A single authenticated connection to a MySQL server
pub struct MySqlConnection {
    framed: Framed<TcpStream, PacketCodec>,
    /// Server address this connection was opened against
    addr: String,
    /// Pool generation at connect time; stale generations are discarded
    generation: u64,
    created_at: Instant,
    last_used_at: Instant,
    capabilities: u32,
    read_timeout: Duration,
    write_timeout: Duration,
    broken: bool,
}

impl MySqlConnection {
    /// Connect and authenticate against `addr` using the credentials in `config`
    pub async fn connect(
        config: &DatabaseConfig,
        addr: &str,
        generation: u64,
    ) -> Result<Self, DriverError> {
        debug!(addr = %addr, "Connecting to database server");

        let connect_timeout = config.connect_timeout();
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(addr = %addr, error = %e, "Failed to connect to database server");
                return Err(DriverError::Connect(e.to_string()));
            }
            Err(_) => return Err(DriverError::Timeout(connect_timeout)),
        };
        let _ = stream.set_nodelay(true);

        let now = Instant::now();
        let mut conn = Self {
            framed: Framed::new(stream, PacketCodec),
            addr: addr.to_string(),
            generation,
            created_at: now,
            last_used_at: now,
            capabilities: 0,
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            broken: false,
        };

        match timeout(connect_timeout, conn.authenticate(config)).await {
            Ok(result) => result?,
            Err(_) => return Err(DriverError::Timeout(connect_timeout)),
        }

        Ok(conn)
    }

    async fn authenticate(&mut self, config: &DatabaseConfig) -> Result<(), DriverError> {
        let handshake_packet = self.recv().await?;
        if is_err_packet(&handshake_packet.payload) {
            return Err(self.server_error(&handshake_packet.payload));
        }

        let handshake = InitialHandshake::parse(&handshake_packet.payload)
            .ok_or_else(|| DriverError::Protocol("Invalid server handshake".into()))?;

        debug!(
            addr = %self.addr,
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            "Received server handshake"
        );

        let mut caps = capabilities::DEFAULT_CAPABILITIES & handshake.capability_flags;
        if config.database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        } else {
            caps &= !capabilities::CLIENT_CONNECT_WITH_DB;
        }
        self.capabilities = caps;

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21, // utf8_general_ci
            username: config.user.clone(),
            auth_response: compute_auth_response(&config.password, &handshake.auth_plugin_data()),
            database: config.database.clone(),
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        };
        self.send(response.encode(handshake_packet.sequence_id.wrapping_add(1)))
            .await?;

        let mut reply = self.recv().await?;

        // Servers defaulting to another plugin ask us to switch; only the
        // native password scramble is supported.
        if let Some(switch) = AuthSwitchRequest::parse(&reply.payload) {
            if switch.plugin_name != NATIVE_PASSWORD_PLUGIN {
                return Err(DriverError::Auth(format!(
                    "unsupported authentication plugin {}",
                    switch.plugin_name
                )));
            }
            let scramble = compute_auth_response(&config.password, &switch.plugin_data);
            self.send(Packet::new(reply.sequence_id.wrapping_add(1), scramble))
                .await?;
            reply = self.recv().await?;
        }

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload, caps)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            error!(
                addr = %self.addr,
                error_code = err.error_code,
                error_message = %err.error_message,
                "Database authentication failed"
            );
            return Err(DriverError::Auth(err.error_message));
        }

        if !is_ok_packet(&reply.payload) {
            return Err(DriverError::Protocol(
                "Expected OK packet after authentication".into(),
            ));
        }

        debug!(addr = %self.addr, "Database authentication successful");
        Ok(())
    }

    /// Send COM_PING and wait for OK
    pub async fn ping(&mut self) -> Result<(), DriverError> {
        self.simple_command(Command::Ping, &[]).await
    }

    /// Reset session state (COM_RESET_CONNECTION) so the connection can be reused
    pub async fn reset(&mut self) -> Result<(), DriverError> {
        self.simple_command(Command::ResetConnection, &[]).await
    }

    /// Switch the default schema (COM_INIT_DB)
    pub async fn change_database(&mut self, db: &str) -> Result<(), DriverError> {
        self.simple_command(Command::InitDb, db.as_bytes()).await
    }

    /// Run a statement, discarding any rows it returns
    pub async fn execute(&mut self, sql: &str) -> Result<ExecResult, DriverError> {
        match self.run_query(sql).await? {
            QueryResponse::Ok(ok) => Ok(ExecResult {
                rows_affected: ok.affected_rows,
                last_insert_id: ok.last_insert_id,
            }),
            QueryResponse::Rows(_) => Ok(ExecResult::default()),
        }
    }

    /// Run a statement and collect its rows
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet, DriverError> {
        match self.run_query(sql).await? {
            QueryResponse::Ok(_) => Ok(ResultSet::default()),
            QueryResponse::Rows(rows) => Ok(rows),
        }
    }

    /// Issue COM_QUERY and read the first response; trailing result sets are drained
    pub(crate) async fn run_query(&mut self, sql: &str) -> Result<QueryResponse, DriverError> {
        self.send(Packet::command(Command::Query, sql.as_bytes()))
            .await?;
        let (response, mut more) = self.read_result().await?;
        while more {
            let (_, next) = self.read_result().await?;
            more = next;
        }
        self.last_used_at = Instant::now();
        Ok(response)
    }

    /// Read one result (OK or result set); the flag reports whether another follows
    async fn read_result(&mut self) -> Result<(QueryResponse, bool), DriverError> {
        let first = self.recv().await?;

        if is_err_packet(&first.payload) {
            return Err(self.server_error(&first.payload));
        }

        if is_ok_packet(&first.payload) {
            let ok = OkPacket::parse(&first.payload, self.capabilities)
                .ok_or_else(|| self.protocol_error("Malformed OK packet"))?;
            let more = ok.status_flags & SERVER_MORE_RESULTS_EXISTS != 0;
            return Ok((QueryResponse::Ok(ok), more));
        }

        let (column_count, _) = read_lenenc_int(&first.payload)
            .ok_or_else(|| self.protocol_error("Malformed column count"))?;
        let column_count = column_count as usize;

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let packet = self.recv().await?;
            let name = parse_column_name(&packet.payload)
                .ok_or_else(|| self.protocol_error("Malformed column definition"))?;
            columns.push(name);
        }

        let eof = self.recv().await?;
        if !is_eof_packet(&eof.payload) {
            return Err(self.protocol_error("Expected EOF after column definitions"));
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.recv().await?;
            if is_err_packet(&packet.payload) {
                return Err(self.server_error(&packet.payload));
            }
            if is_eof_packet(&packet.payload) {
                let status = if packet.payload.len() >= 5 {
                    u16::from_le_bytes([packet.payload[3], packet.payload[4]])
                } else {
                    0
                };
                let more = status & SERVER_MORE_RESULTS_EXISTS != 0;
                return Ok((QueryResponse::Rows(ResultSet { columns, rows }), more));
            }
            let row = parse_text_row(&packet.payload, column_count)
                .ok_or_else(|| self.protocol_error("Malformed row"))?;
            rows.push(row);
        }
    }

    async fn simple_command(&mut self, command: Command, argument: &[u8]) -> Result<(), DriverError> {
        self.send(Packet::command(command, argument)).await?;
        let response = self.recv().await?;
        if is_err_packet(&response.payload) {
            return Err(self.server_error(&response.payload));
        }
        if !is_ok_packet(&response.payload) {
            return Err(self.protocol_error("Expected OK packet"));
        }
        self.last_used_at = Instant::now();
        Ok(())
    }

    /// Best-effort COM_QUIT before dropping the socket
    pub async fn quit(mut self) {
        let _ = timeout(
            self.write_timeout,
            self.framed.send(Packet::command(Command::Quit, &[])),
        )
        .await;
    }

    async fn send(&mut self, packet: Packet) -> Result<(), DriverError> {
        match timeout(self.write_timeout, self.framed.send(packet)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.broken = true;
                Err(DriverError::Io(e.to_string()))
            }
            Err(_) => {
                self.broken = true;
                Err(DriverError::Timeout(self.write_timeout))
            }
        }
    }

    async fn recv(&mut self) -> Result<Packet, DriverError> {
        match timeout(self.read_timeout, self.framed.next()).await {
            Ok(Some(Ok(packet))) => Ok(packet),
            Ok(Some(Err(e))) => {
                self.broken = true;
                Err(DriverError::Io(e.to_string()))
            }
            Ok(None) => {
                self.broken = true;
                Err(DriverError::Disconnected)
            }
            Err(_) => {
                self.broken = true;
                Err(DriverError::Timeout(self.read_timeout))
            }
        }
    }

    fn server_error(&self, payload: &[u8]) -> DriverError {
        match ErrPacket::parse(payload, self.capabilities) {
            Some(err) => DriverError::Server {
                code: err.error_code,
                sql_state: err.sql_state,
                message: err.error_message,
            },
            None => DriverError::Protocol("Malformed ERR packet".into()),
        }
    }

    fn protocol_error(&mut self, message: &str) -> DriverError {
        // The stream position is unknown after a parse failure
        self.broken = true;
        DriverError::Protocol(message.to_string())
    }

    /// Check if connection has exceeded max age
    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }

    /// Check if connection has been idle too long
    pub fn is_idle_too_long(&self, max_idle: Duration) -> bool {
        self.last_used_at.elapsed() > max_idle
    }

    /// Whether an I/O or framing error left the connection unusable
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}
