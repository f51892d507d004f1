use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::controller::Controller;
use crate::error::{Result, RouterError};
use crate::types::{MacAddr, PortNo, SwitchId, str_to_dpid, str_to_port_no};

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: u16,
    pub body: Value,
}

impl ControlResponse {
    fn ok(body: Value) -> Self {
        Self { status: STATUS_OK, body }
    }

    fn ack() -> Self {
        Self::ok(json!({"msg": "OK"}))
    }

    fn from_error(e: &RouterError) -> Self {
        let status = if e.is_not_found() { STATUS_NOT_FOUND } else { STATUS_BAD_REQUEST };
        Self {
            status,
            body: json!({"error": e.to_string()}),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlCommand {
    pub command: String,
    #[serde(default)]
    pub args: Option<Value>,
}

/// Line-oriented JSON admin interface over TCP.
pub struct ControlServer {
    bind_addr: String,
    controller: Arc<Controller>,
}

impl ControlServer {
    pub fn new(bind_addr: impl Into<String>, controller: Arc<Controller>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            controller,
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        info!("Control server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("Control connection from {}", addr);
                    let controller = self.controller.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_client(stream, controller).await {
                            error!("Error handling control client {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                }
            }
        }
    }

    async fn handle_client(mut stream: TcpStream, controller: Arc<Controller>) -> anyhow::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<ControlCommand>(trimmed) {
                        Ok(command) => Self::process_command(command, &controller).await,
                        Err(e) => ControlResponse::from_error(&RouterError::BadRequest(format!(
                            "invalid JSON command: {}",
                            e
                        ))),
                    };

                    let response_json = serde_json::to_string(&response)?;
                    writer.write_all(format!("{}\n", response_json).as_bytes()).await?;
                    writer.flush().await?;
                }
                Err(e) => {
                    error!("Error reading from control client: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    pub async fn process_command(command: ControlCommand, controller: &Controller) -> ControlResponse {
        let args = command.args.unwrap_or(Value::Null);
        let result = match command.command.as_str() {
            "switches" => Self::get_switches(controller).await,
            "switch" => Self::get_switch(&args, controller).await,
            "arp" => Self::get_arp(&args, controller).await,
            "put_arp" => Self::put_arp(&args, controller).await,
            "ports" => Self::get_ports(&args, controller).await,
            "routing_table" => Self::get_routing_table(&args, controller).await,
            "put_gateway" => Self::put_gateway(&args, controller).await,
            "help" => Ok(Self::get_help()),
            other => Err(RouterError::BadRequest(format!("unknown command: {}", other))),
        };

        match result {
            Ok(response) => response,
            Err(e) => ControlResponse::from_error(&e),
        }
    }

    async fn get_switches(controller: &Controller) -> Result<ControlResponse> {
        Ok(ControlResponse::ok(to_body(controller.switch_views().await)?))
    }

    async fn get_switch(args: &Value, controller: &Controller) -> Result<ControlResponse> {
        let dpid = dpid_arg(args)?;
        Ok(ControlResponse::ok(to_body(controller.switch_view(dpid).await?)?))
    }

    async fn get_arp(args: &Value, controller: &Controller) -> Result<ControlResponse> {
        let dpid = dpid_arg(args)?;
        Ok(ControlResponse::ok(to_body(controller.arp_table(dpid).await?)?))
    }

    async fn put_arp(args: &Value, controller: &Controller) -> Result<ControlResponse> {
        let dpid = dpid_arg(args)?;
        let ip: Ipv4Addr = parse_field(args, "ip")?;
        let hw_addr: MacAddr = str_arg(args, "hw_addr")?
            .parse()
            .map_err(|_| RouterError::BadRequest("invalid hw_addr".to_string()))?;
        controller.put_arp(dpid, ip, hw_addr).await?;
        Ok(ControlResponse::ack())
    }

    async fn get_ports(args: &Value, controller: &Controller) -> Result<ControlResponse> {
        let dpid = dpid_arg(args)?;
        Ok(ControlResponse::ok(to_body(controller.port_views(dpid).await?)?))
    }

    async fn get_routing_table(args: &Value, controller: &Controller) -> Result<ControlResponse> {
        let dpid = dpid_arg(args)?;
        Ok(ControlResponse::ok(to_body(controller.routing_table(dpid).await?)?))
    }

    async fn put_gateway(args: &Value, controller: &Controller) -> Result<ControlResponse> {
        let dpid = dpid_arg(args)?;
        let port_no = port_no_arg(args)?;
        let ipv4: Ipv4Addr = parse_field(args, "ipv4")?;
        let ipv4_prefixlen = prefixlen_arg(args, "ipv4_prefixlen")?;
        let ipv6: Ipv6Addr = match args.get("ipv6") {
            None | Some(Value::Null) => Ipv6Addr::UNSPECIFIED,
            Some(_) => parse_field(args, "ipv6")?,
        };
        let ipv6_prefixlen = match args.get("ipv6_prefixlen") {
            None | Some(Value::Null) => 0,
            Some(_) => prefixlen_arg(args, "ipv6_prefixlen")?,
        };

        controller
            .set_gateway(dpid, port_no, ipv4, ipv4_prefixlen, ipv6, ipv6_prefixlen)
            .await?;
        Ok(ControlResponse::ack())
    }

    fn get_help() -> ControlResponse {
        let commands = vec![
            ("switches", "List every switch"),
            ("switch", "Show one switch (requires dpid)"),
            ("arp", "Show the ARP table of a switch (requires dpid)"),
            ("put_arp", "Add or update an ARP entry (requires dpid, ip, hw_addr)"),
            ("ports", "List the ports of a switch (requires dpid)"),
            ("routing_table", "Show the routing table of a switch (requires dpid)"),
            (
                "put_gateway",
                "Set a port gateway (requires dpid, port_no, ipv4, ipv4_prefixlen; optional ipv6, ipv6_prefixlen)",
            ),
            ("help", "Show this help message"),
        ];

        ControlResponse::ok(json!(commands))
    }
}

fn to_body<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| RouterError::BadRequest(e.to_string()))
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RouterError::BadRequest(format!("missing or invalid {}", key)))
}

fn parse_field<T: std::str::FromStr>(args: &Value, key: &str) -> Result<T> {
    str_arg(args, key)?
        .parse()
        .map_err(|_| RouterError::BadRequest(format!("invalid {}", key)))
}

fn dpid_arg(args: &Value) -> Result<SwitchId> {
    str_to_dpid(str_arg(args, "dpid")?).ok_or_else(|| RouterError::BadRequest("invalid dpid".to_string()))
}

/// Accepts the fixed-width hex form or a plain JSON number.
fn port_no_arg(args: &Value) -> Result<PortNo> {
    let invalid = || RouterError::BadRequest("invalid port_no".to_string());
    match args.get("port_no") {
        Some(Value::String(s)) => str_to_port_no(s).ok_or_else(invalid),
        Some(Value::Number(n)) => n.as_u64().and_then(|n| PortNo::try_from(n).ok()).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Prefix lengths arrive either as numbers or numeric strings.
fn prefixlen_arg(args: &Value, key: &str) -> Result<u8> {
    let invalid = || RouterError::BadRequest(format!("invalid {}", key));
    match args.get(key) {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u8::try_from(n).ok()).ok_or_else(invalid),
        Some(Value::String(s)) => s.trim().parse::<u8>().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_lengths_accept_numbers_and_strings() {
        let args = json!({"a": 24, "b": "16", "c": "x", "d": 300});
        assert_eq!(prefixlen_arg(&args, "a").unwrap(), 24);
        assert_eq!(prefixlen_arg(&args, "b").unwrap(), 16);
        assert!(prefixlen_arg(&args, "c").is_err());
        assert!(prefixlen_arg(&args, "d").is_err());
        assert!(prefixlen_arg(&args, "missing").is_err());
    }

    #[test]
    fn ids_are_parsed_in_fixed_width_hex() {
        assert_eq!(dpid_arg(&json!({"dpid": "0000000000000001"})).unwrap(), 1);
        assert!(dpid_arg(&json!({"dpid": "1"})).is_err());
        assert_eq!(port_no_arg(&json!({"port_no": "00000002"})).unwrap(), 2);
        assert_eq!(port_no_arg(&json!({"port_no": 3})).unwrap(), 3);
        assert!(port_no_arg(&json!({})).is_err());
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(ControlResponse::from_error(&RouterError::SwitchNotFound(1)).status, STATUS_NOT_FOUND);
        assert_eq!(ControlResponse::from_error(&RouterError::PortNotFound(1, 2)).status, STATUS_NOT_FOUND);
        assert_eq!(
            ControlResponse::from_error(&RouterError::BadRequest("x".into())).status,
            STATUS_BAD_REQUEST
        );
        assert_eq!(ControlResponse::ack().body, json!({"msg": "OK"}));
    }
}
