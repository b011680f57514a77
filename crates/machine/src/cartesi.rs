//! JSON-RPC client binding for a remote Cartesi machine manager.
//!
//! Every loaded machine lives in its own manager process and is driven over
//! HTTP JSON-RPC. This module implements [`MachineBinding`] on top of that
//! wire contract, so the driver above it never sees the transport.
//!
//! ## Endpoints
//!
//! An endpoint is a `host:port` pair or a full `http://` URL. The manager's
//! `machine.fork` reply carries the child's bare address, and
//! [`MachineBinding::connect`] accepts either form, so fork output feeds
//! straight back into connect without rewriting.
//!
//! ## Binary payloads
//!
//! Memory contents travel as standard base64 strings; root hashes travel as
//! hex strings. Registers are plain JSON numbers.

use crate::bindings::{
    BreakReason, BufferConfig, MachineBinding, MachineError, MachineResult, RuntimeConfig,
};
use crate::rollup::{CycleBudget, RollupMachine, RollupResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use oren_common::types::Hash32;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

// ════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════

/// Hard cap on any single RPC round trip. Sized for the longest `machine.run`
/// slice a sane cycle increment produces, not for interactive latency.
const RPC_TIMEOUT: Duration = Duration::from_secs(300);

/// Manager error code meaning no machine is loaded in the process.
const RPC_CODE_NO_MACHINE: i64 = -32001;

// ════════════════════════════════════════════════════════════════════════════
// RPC ENVELOPE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Reply shape of `machine.run`.
#[derive(Debug, Deserialize)]
struct RunReply {
    break_reason: String,
}

/// Reply shape of `machine.fork`.
#[derive(Debug, Deserialize)]
struct ForkReply {
    address: String,
}

/// Reply shape of `machine.initial_config`, reduced to the fields the
/// driver needs. Buffer lengths and the rest of the config are ignored.
#[derive(Debug, Deserialize)]
struct BufferReply {
    start: u64,
}

#[derive(Debug, Deserialize)]
struct InitialConfigReply {
    rx_buffer: BufferReply,
    tx_buffer: BufferReply,
}

// ════════════════════════════════════════════════════════════════════════════
// TRANSPORT HELPERS
// ════════════════════════════════════════════════════════════════════════════

fn rpc_url(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

fn build_client(endpoint: &str) -> MachineResult<Client> {
    Client::builder()
        .timeout(RPC_TIMEOUT)
        .build()
        .map_err(|e| MachineError::Transport {
            endpoint: endpoint.to_string(),
            reason: format!("failed to build http client: {e}"),
        })
}

fn transport_error(endpoint: &str, error: &reqwest::Error) -> MachineError {
    let reason = if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        "connection refused".to_string()
    } else {
        error.to_string()
    };
    MachineError::Transport {
        endpoint: endpoint.to_string(),
        reason,
    }
}

/// One JSON-RPC round trip against `endpoint`.
///
/// A `null` or absent `result` comes back as [`Value::Null`]; methods whose
/// replies are pure acknowledgements discard it.
async fn rpc_call(
    client: &Client,
    endpoint: &str,
    id: u64,
    method: &str,
    params: Value,
) -> MachineResult<Value> {
    let request = RpcRequest {
        jsonrpc: "2.0",
        id,
        method,
        params,
    };

    let response = client
        .post(rpc_url(endpoint))
        .json(&request)
        .send()
        .await
        .map_err(|e| transport_error(endpoint, &e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(MachineError::Transport {
            endpoint: endpoint.to_string(),
            reason: format!("http status {status}"),
        });
    }

    let reply: RpcResponse = response.json().await.map_err(|e| MachineError::BadResponse {
        method: method.to_string(),
        reason: format!("invalid json-rpc body: {e}"),
    })?;

    if let Some(error) = reply.error {
        if error.code == RPC_CODE_NO_MACHINE {
            return Err(MachineError::NotFound {
                endpoint: endpoint.to_string(),
            });
        }
        return Err(MachineError::Call {
            method: method.to_string(),
            code: error.code,
            message: error.message,
        });
    }

    Ok(reply.result.unwrap_or(Value::Null))
}

async fn fetch_buffer_config(client: &Client, endpoint: &str) -> MachineResult<BufferConfig> {
    let value = rpc_call(client, endpoint, 0, "machine.initial_config", json!({})).await?;
    let config: InitialConfigReply =
        serde_json::from_value(value).map_err(|e| MachineError::BadResponse {
            method: "machine.initial_config".to_string(),
            reason: e.to_string(),
        })?;
    Ok(BufferConfig {
        rx_buffer_start: config.rx_buffer.start,
        tx_buffer_start: config.tx_buffer.start,
    })
}

// ════════════════════════════════════════════════════════════════════════════
// CLIENT
// ════════════════════════════════════════════════════════════════════════════

/// Handle to one machine inside one remote manager process.
///
/// The handle is cheap to move between tasks; the underlying `reqwest`
/// client pools connections internally. Forked children created through
/// [`MachineBinding::connect`] reuse the parent's client.
#[derive(Debug)]
pub struct CartesiMachine {
    client: Client,
    endpoint: String,
    buffers: BufferConfig,
    request_id: AtomicU64,
}

impl CartesiMachine {
    /// Loads a machine snapshot into the manager at `endpoint` and binds
    /// to it.
    pub async fn load(
        endpoint: &str,
        snapshot_path: &str,
        runtime: &RuntimeConfig,
    ) -> MachineResult<Self> {
        let client = build_client(endpoint)?;
        rpc_call(
            &client,
            endpoint,
            0,
            "machine.load",
            json!({ "path": snapshot_path, "runtime": runtime }),
        )
        .await?;
        let buffers = fetch_buffer_config(&client, endpoint).await?;
        info!(endpoint, path = snapshot_path, "loaded machine snapshot");
        Ok(Self::assemble(client, endpoint, buffers))
    }

    /// Binds to a machine already loaded in the manager at `endpoint`.
    pub async fn attach(endpoint: &str) -> MachineResult<Self> {
        let client = build_client(endpoint)?;
        let buffers = fetch_buffer_config(&client, endpoint).await?;
        debug!(endpoint, "attached to loaded machine");
        Ok(Self::assemble(client, endpoint, buffers))
    }

    fn assemble(client: Client, endpoint: &str, buffers: BufferConfig) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            buffers,
            request_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> MachineResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        rpc_call(&self.client, &self.endpoint, id, method, params).await
    }

    async fn call_as<R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> MachineResult<R> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| MachineError::BadResponse {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }
}

impl RollupMachine<CartesiMachine> {
    /// Loads a snapshot into the manager at `endpoint` and wraps the
    /// binding in a primed rollup driver.
    pub async fn load(
        endpoint: &str,
        snapshot_path: &str,
        runtime: &RuntimeConfig,
        budget: CycleBudget,
    ) -> RollupResult<Self> {
        let binding = CartesiMachine::load(endpoint, snapshot_path, runtime).await?;
        Self::new(binding, budget).await
    }
}

// ════════════════════════════════════════════════════════════════════════════
// BINDING IMPLEMENTATION
// ════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl MachineBinding for CartesiMachine {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn buffer_config(&self) -> BufferConfig {
        self.buffers
    }

    async fn run(&mut self, target_cycle: u64) -> MachineResult<BreakReason> {
        let reply: RunReply = self
            .call_as("machine.run", json!({ "target_cycle": target_cycle }))
            .await?;
        BreakReason::parse(&reply.break_reason)
    }

    async fn read_mcycle(&self) -> MachineResult<u64> {
        self.call_as("machine.read_mcycle", json!({})).await
    }

    async fn read_iflags_y(&self) -> MachineResult<bool> {
        self.call_as("machine.read_iflags_y", json!({})).await
    }

    async fn reset_iflags_y(&mut self) -> MachineResult<()> {
        self.call("machine.reset_iflags_y", json!({})).await?;
        Ok(())
    }

    async fn read_htif_tohost_data(&self) -> MachineResult<u64> {
        self.call_as("machine.read_htif_tohost_data", json!({})).await
    }

    async fn read_htif_fromhost(&self) -> MachineResult<u64> {
        self.call_as("machine.read_htif_fromhost", json!({})).await
    }

    async fn write_htif_fromhost_data(&mut self, value: u64) -> MachineResult<()> {
        self.call("machine.write_htif_fromhost_data", json!({ "value": value }))
            .await?;
        Ok(())
    }

    async fn read_memory(&self, address: u64, length: u64) -> MachineResult<Vec<u8>> {
        let encoded: String = self
            .call_as(
                "machine.read_memory",
                json!({ "address": address, "length": length }),
            )
            .await?;
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| MachineError::BadResponse {
                method: "machine.read_memory".to_string(),
                reason: format!("invalid base64 payload: {e}"),
            })?;
        if bytes.len() as u64 != length {
            return Err(MachineError::BadResponse {
                method: "machine.read_memory".to_string(),
                reason: format!("expected {length} bytes, got {}", bytes.len()),
            });
        }
        Ok(bytes)
    }

    async fn write_memory(&mut self, address: u64, data: &[u8]) -> MachineResult<()> {
        self.call(
            "machine.write_memory",
            json!({ "address": address, "data": BASE64.encode(data) }),
        )
        .await?;
        Ok(())
    }

    async fn read_root_hash(&self) -> MachineResult<Hash32> {
        let hex_hash: String = self.call_as("machine.get_root_hash", json!({})).await?;
        Hash32::from_hex(&hex_hash).map_err(|e| MachineError::BadResponse {
            method: "machine.get_root_hash".to_string(),
            reason: e.to_string(),
        })
    }

    async fn snapshot(&mut self) -> MachineResult<()> {
        self.call("machine.snapshot", json!({})).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> MachineResult<()> {
        self.call("machine.rollback", json!({})).await?;
        Ok(())
    }

    async fn fork(&self) -> MachineResult<String> {
        let reply: ForkReply = self.call_as("machine.fork", json!({})).await?;
        debug!(parent = %self.endpoint, child = %reply.address, "forked machine");
        Ok(reply.address)
    }

    async fn connect(&self, endpoint: &str) -> MachineResult<Self> {
        // Refetching the config doubles as a liveness probe on the child.
        let buffers = fetch_buffer_config(&self.client, endpoint).await?;
        debug!(endpoint, "connected to forked machine");
        Ok(Self {
            client: self.client.clone(),
            endpoint: endpoint.to_string(),
            buffers,
            request_id: AtomicU64::new(1),
        })
    }

    async fn shutdown_endpoint(&self, endpoint: &str) -> MachineResult<()> {
        rpc_call(&self.client, endpoint, 0, "machine.shutdown", json!({})).await?;
        debug!(endpoint, "shut down remote manager");
        Ok(())
    }

    async fn destroy(&mut self) -> MachineResult<()> {
        self.call("machine.destroy", json!({})).await?;
        debug!(endpoint = %self.endpoint, "destroyed machine");
        Ok(())
    }

    async fn shutdown(&mut self) -> MachineResult<()> {
        self.call("machine.shutdown", json!({})).await?;
        debug!(endpoint = %self.endpoint, "shut down manager process");
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
