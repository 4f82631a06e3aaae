//! Thin typed wrappers over the raw command interface.
//!
//! Each wrapper encodes its arguments as a RESP array, sends it through
//! [`Connection::send`], and decodes the single expected reply shape.
//! Anything not covered here goes through `send` directly.

use crate::connection::{Connection, ConnectionError};
use crate::resp::RespValue;

impl Connection {
    /// Checks the server is alive.
    ///
    /// Without a payload the server answers `PONG`; with one it echoes
    /// the payload back. Allowed while subscribed.
    pub async fn ping(&self, payload: Option<&[u8]>) -> Result<Vec<u8>, ConnectionError> {
        let reply = match payload {
            Some(data) => self.send("PING", &[data]).await?,
            None => self.send("PING", &[]).await?,
        };

        match reply {
            RespValue::SimpleString(text) => Ok(text.into_bytes()),
            RespValue::BulkString(Some(data)) => Ok(data),
            _ => Err(ConnectionError::UnexpectedResponse),
        }
    }

    /// Echoes `message` back from the server.
    pub async fn echo(&self, message: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        match self.send("ECHO", &[message]).await? {
            RespValue::BulkString(Some(data)) => Ok(data),
            _ => Err(ConnectionError::UnexpectedResponse),
        }
    }

    /// Authenticates the connection.
    pub async fn auth(&self, password: &[u8]) -> Result<(), ConnectionError> {
        match self.send("AUTH", &[password]).await? {
            RespValue::SimpleString(_) => Ok(()),
            _ => Err(ConnectionError::UnexpectedResponse),
        }
    }

    /// Fetches the value stored at `key`.
    ///
    /// Returns `Ok(None)` when the key does not exist.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ConnectionError> {
        match self.send("GET", &[key]).await? {
            RespValue::BulkString(data) => Ok(data),
            _ => Err(ConnectionError::UnexpectedResponse),
        }
    }

    /// Stores `value` at `key`.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), ConnectionError> {
        match self.send("SET", &[key, value]).await? {
            RespValue::SimpleString(_) => Ok(()),
            _ => Err(ConnectionError::UnexpectedResponse),
        }
    }

    /// Deletes `keys`, returning how many of them existed.
    pub async fn del(&self, keys: &[&[u8]]) -> Result<i64, ConnectionError> {
        match self.send("DEL", keys).await? {
            RespValue::Integer(count) => Ok(count),
            _ => Err(ConnectionError::UnexpectedResponse),
        }
    }

    /// Publishes `payload` to `channel`.
    ///
    /// # Returns
    ///
    /// * `Ok(count)` - Number of subscribers the server delivered the
    ///   message to
    /// * `Err(ConnectionError::PubSubMode)` - This connection is itself
    ///   subscribed; publish from another connection
    pub async fn publish(&self, channel: &[u8], payload: &[u8]) -> Result<i64, ConnectionError> {
        match self.send("PUBLISH", &[channel, payload]).await? {
            RespValue::Integer(count) => Ok(count),
            _ => Err(ConnectionError::UnexpectedResponse),
        }
    }
}
