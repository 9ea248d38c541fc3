// ABOUTME: Worker-side connection to the supervisor.
// ABOUTME: Identifies the worker with a fresh hex instance id and exchanges message lines.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::Result;
use crate::message::Message;

/// Generate an instance id. Always hex, so receipts using it route by id.
pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Connection from a service instance to the supervisor.
pub struct ServiceClient {
    reader: BufReader<OwnedReadHalf>,
    line: Vec<u8>,
    writer: OwnedWriteHalf,
    service_name: Option<String>,
    service_id: Option<String>,
}

impl ServiceClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
            writer,
            service_name: None,
            service_id: None,
        })
    }

    /// Identify as a new instance of `service_name`. Returns the instance id.
    pub async fn identify(&mut self, service_name: &str) -> Result<String> {
        let service_id = new_instance_id();
        self.identify_as(service_name, &service_id).await?;
        Ok(service_id)
    }

    /// Identify with an explicit instance id.
    pub async fn identify_as(&mut self, service_name: &str, service_id: &str) -> Result<()> {
        self.write(&Message::identify(service_name, service_id)).await?;
        self.service_name = Some(service_name.to_string());
        self.service_id = Some(service_id.to_string());
        Ok(())
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    pub fn service_id(&self) -> Option<&str> {
        self.service_id.as_deref()
    }

    /// Send `message`, stamping this instance as sender once identified.
    pub async fn send(&mut self, mut message: Message) -> Result<()> {
        if message.sender().is_none() {
            message.sender = self.service_id.clone();
        }
        self.write(&message).await
    }

    async fn write(&mut self, message: &Message) -> Result<()> {
        let line = message.encode_line()?;
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Next message from the supervisor, or `None` once it hangs up.
    /// Undecodable lines, including invalid UTF-8, are skipped.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                return Ok(None);
            }
            match Message::decode_bytes(&self.line) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => tracing::debug!(error = %e, "Skipping undecodable line"),
            }
        }
    }
}
