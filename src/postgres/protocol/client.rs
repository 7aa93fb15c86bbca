//! PostgreSQL replication client
//!
//! TCP client speaking the replication sub-protocol: startup with
//! `replication=database`, cleartext/MD5 authentication, replication
//! commands (`IDENTIFY_SYSTEM`, `CREATE_REPLICATION_SLOT`,
//! `START_REPLICATION`), and the CopyBoth stream that carries WAL data.
//! Every read and write is guarded by an I/O timeout so a dead peer
//! cannot wedge the slot worker.

use anyhow::{anyhow, bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

/// Connection establishment timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-operation I/O timeout. Longer than the server keepalive interval,
/// so an idle but healthy stream never trips it.
pub const IO_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound on a single protocol message; larger frames indicate a
/// corrupt stream.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Offset of the Postgres epoch (2000-01-01) from the Unix epoch.
const PG_EPOCH_UNIX_SECS: u64 = 946_684_800;

/// Microseconds since the Postgres epoch, for standby status messages.
pub fn pg_epoch_micros_now() -> i64 {
    let pg_epoch = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(PG_EPOCH_UNIX_SECS);
    std::time::SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// A connection in replication mode.
pub struct ReplicationClient {
    stream: BufReader<TcpStream>,
    database: String,
}

impl ReplicationClient {
    /// Connect and authenticate in replication mode.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        database: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        info!(host, port, user, database, "Connecting in replication mode");

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .context("Connect timeout")??;
        let mut stream = BufReader::new(stream);

        let params = vec![
            ("user", user),
            ("database", database),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.into_iter(), &mut buf)?;
        write_all(&mut stream, &buf).await?;

        // Authentication exchange
        loop {
            let (tag, body) = read_message(&mut stream).await?;

            let mut raw = BytesMut::with_capacity(1 + 4 + body.len());
            raw.put_u8(tag);
            raw.put_i32((body.len() + 4) as i32);
            raw.put_slice(&body);
            let msg = backend::Message::parse(&mut raw)?
                .ok_or_else(|| anyhow!("Failed to parse auth message"))?;

            match msg {
                backend::Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    break;
                }
                backend::Message::AuthenticationCleartextPassword => {
                    let pass = password.ok_or_else(|| anyhow!("Password required"))?;
                    let mut buf = BytesMut::new();
                    frontend::password_message(pass.as_bytes(), &mut buf)?;
                    write_all(&mut stream, &buf).await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let pass = password.ok_or_else(|| anyhow!("Password required"))?;
                    let hashed = md5_password(user, pass, &body.salt());
                    let mut buf = BytesMut::new();
                    frontend::password_message(hashed.as_bytes(), &mut buf)?;
                    write_all(&mut stream, &buf).await?;
                }
                backend::Message::AuthenticationSasl(_) => {
                    bail!("SCRAM authentication is not supported; use md5 or password auth for the replication role");
                }
                backend::Message::ErrorResponse(_) => bail!("Authentication rejected by server"),
                _ => bail!("Unexpected message during authentication: {}", tag as char),
            }
        }

        // Drain parameter status / backend key data until ReadyForQuery
        loop {
            let (tag, _) = read_message(&mut stream).await?;
            match tag {
                b'Z' => break,
                b'E' => bail!("Error while waiting for ready"),
                _ => {}
            }
        }

        Ok(Self {
            stream,
            database: database.to_string(),
        })
    }

    /// The connected database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// `IDENTIFY_SYSTEM`: returns the server's current WAL flush position.
    pub async fn identify_system(&mut self) -> Result<u64> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.first().ok_or_else(|| anyhow!("Empty IDENTIFY_SYSTEM response"))?;
        // Columns: systemid, timeline, xlogpos, dbname
        let xlogpos = row
            .get(2)
            .and_then(|v| v.as_deref())
            .ok_or_else(|| anyhow!("IDENTIFY_SYSTEM missing xlogpos"))?;
        crate::common::parse_lsn(xlogpos)
            .ok_or_else(|| anyhow!("Unparseable xlogpos: {xlogpos}"))
    }

    /// Create a logical replication slot using the pgoutput plugin.
    pub async fn create_slot(&mut self, slot_name: &str) -> Result<()> {
        validate_identifier(slot_name)?;
        self.simple_query(&format!(
            "CREATE_REPLICATION_SLOT {slot_name} LOGICAL pgoutput"
        ))
        .await?;
        Ok(())
    }

    /// Start streaming from `start_lsn`, consuming this client.
    ///
    /// Passing `start_lsn = 0` asks the server to stream from the slot's
    /// own restart position.
    pub async fn start_replication(
        mut self,
        slot_name: &str,
        publication: &str,
        start_lsn: u64,
    ) -> Result<ReplicationStream> {
        validate_identifier(slot_name)?;
        validate_identifier(publication)?;

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            slot_name,
            crate::common::format_lsn(start_lsn),
            publication
        );
        debug!(%query, "Starting replication");

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        write_all(&mut self.stream, &buf).await?;

        let (tag, _) = read_message(&mut self.stream).await?;
        match tag {
            b'W' => {
                info!(slot_name, publication, "Entered CopyBoth mode");
                Ok(ReplicationStream {
                    stream: self.stream,
                })
            }
            b'E' => bail!("Server rejected START_REPLICATION"),
            t => bail!("Unexpected response to START_REPLICATION: {}", t as char),
        }
    }

    /// Run a simple query, collecting DataRow values as text.
    async fn simple_query(&mut self, query: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        write_all(&mut self.stream, &buf).await?;

        let mut rows = Vec::new();
        loop {
            let (tag, body) = read_message(&mut self.stream).await?;
            match tag {
                b'D' => rows.push(parse_data_row(&body)?),
                b'Z' => break,
                b'E' => bail!("Server error running {query:?}"),
                _ => {}
            }
        }
        Ok(rows)
    }
}

/// The CopyBoth stream carrying WAL data.
pub struct ReplicationStream {
    stream: BufReader<TcpStream>,
}

impl ReplicationStream {
    /// Read the next CopyData payload.
    ///
    /// Returns `Ok(None)` when the server ends the stream (CopyDone).
    pub async fn next_payload(&mut self) -> Result<Option<Bytes>> {
        let (tag, body) = read_message(&mut self.stream).await?;
        match tag {
            b'd' => Ok(Some(Bytes::from(body))),
            b'c' => Ok(None),
            b'E' => bail!("Server error on replication stream"),
            t => bail!("Unexpected stream message: {}", t as char),
        }
    }

    /// Send a standby status update confirming positions up to `lsn`.
    ///
    /// Write, flush, and apply positions are all reported as `lsn`: a
    /// transaction is only confirmed after its events are durably in the
    /// message log, at which point all three coincide.
    pub async fn send_status_update(&mut self, lsn: u64, reply_requested: bool) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(lsn);
        payload.put_u64(lsn);
        payload.put_u64(lsn);
        payload.put_i64(pg_epoch_micros_now());
        payload.put_u8(u8::from(reply_requested));

        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        write_all(&mut self.stream, &frame).await
    }
}

async fn read_message(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let (tag, len) = timeout(IO_TIMEOUT, async {
        let tag = stream.read_u8().await?;
        let len = stream.read_i32().await?;
        Ok::<_, std::io::Error>((tag, len))
    })
    .await
    .context("Read timeout")?
    .context("Failed to read message header")?;

    let len = len as usize;
    if len < 4 {
        bail!("Invalid message length: {len}");
    }
    if len > MAX_MESSAGE_SIZE {
        bail!("Message of {len} bytes exceeds limit");
    }

    let mut body = vec![0u8; len - 4];
    timeout(IO_TIMEOUT, stream.read_exact(&mut body))
        .await
        .context("Read timeout")?
        .context("Failed to read message body")?;

    Ok((tag, body))
}

async fn write_all(stream: &mut BufReader<TcpStream>, data: &[u8]) -> Result<()> {
    timeout(IO_TIMEOUT, async {
        stream.get_mut().write_all(data).await?;
        stream.get_mut().flush().await?;
        Ok::<_, std::io::Error>(())
    })
    .await
    .context("Write timeout")?
    .context("Failed to write")?;
    Ok(())
}

/// Parse a DataRow body into optional text column values.
fn parse_data_row(body: &[u8]) -> Result<Vec<Option<String>>> {
    let mut buf = Bytes::copy_from_slice(body);
    use bytes::Buf;

    if buf.remaining() < 2 {
        bail!("Short DataRow");
    }
    let num_cols = buf.get_u16();
    let mut row = Vec::with_capacity(num_cols as usize);
    for _ in 0..num_cols {
        if buf.remaining() < 4 {
            bail!("Short DataRow column header");
        }
        let len = buf.get_i32();
        if len < 0 {
            row.push(None);
        } else {
            let len = len as usize;
            if buf.remaining() < len {
                bail!("Short DataRow column value");
            }
            let value = buf.copy_to_bytes(len);
            row.push(Some(String::from_utf8_lossy(&value).into_owned()));
        }
    }
    Ok(row)
}

/// Reject identifiers that could smuggle SQL into replication commands.
fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        bail!("Invalid identifier length: {name:?}");
    }
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        bail!("Invalid identifier: {name:?}");
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        bail!("Invalid identifier: {name:?}");
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("Invalid identifier: {name:?}");
    }
    Ok(())
}

fn md5_password(user: &str, pass: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(pass);
    hasher.update(user);
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password_format() {
        let hashed = md5_password("postgres", "secret", &[1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 3 + 32);
        // Deterministic
        assert_eq!(hashed, md5_password("postgres", "secret", &[1, 2, 3, 4]));
        assert_ne!(hashed, md5_password("postgres", "other", &[1, 2, 3, 4]));
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("riffle_slot").is_ok());
        assert!(validate_identifier("_pub1").is_ok());

        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1slot").is_err());
        assert!(validate_identifier("slot; DROP TABLE users").is_err());
        assert!(validate_identifier("slot name").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_parse_data_row() {
        let mut buf = BytesMut::new();
        buf.put_u16(3);
        buf.put_i32(2);
        buf.put_slice(b"ab");
        buf.put_i32(-1); // NULL
        buf.put_i32(0);

        let row = parse_data_row(&buf).unwrap();
        assert_eq!(row[0].as_deref(), Some("ab"));
        assert_eq!(row[1], None);
        assert_eq!(row[2].as_deref(), Some(""));
    }

    #[test]
    fn test_parse_data_row_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_i32(10);
        buf.put_slice(b"ab"); // claims 10, has 2
        assert!(parse_data_row(&buf).is_err());
    }

    #[test]
    fn test_pg_epoch_micros_is_positive() {
        assert!(pg_epoch_micros_now() > 0);
    }
}
