//! Interactive operator console.
//!
//! Reads commands from stdin and drives the relay through its
//! [`RelayHandle`]; everything here has a programmatic equivalent, the
//! console is only a front-end for a human at the terminal.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use roomlink_protocol::{GameType, RoomId};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::control::{RefreshOutcome, RelayHandle};

/// Runtime toggle for the debug log level.
pub struct DebugControl {
    state: AtomicBool,
    apply: Box<dyn Fn(bool) + Send + Sync>,
}

impl DebugControl {
    pub fn new(initial: bool, apply: impl Fn(bool) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicBool::new(initial),
            apply: Box::new(apply),
        })
    }

    pub fn set(&self, on: bool) {
        self.state.store(on, Ordering::Relaxed);
        (self.apply)(on);
    }

    pub fn get(&self) -> bool {
        self.state.load(Ordering::Relaxed)
    }
}

/// Read commands from stdin until `exit` (or EOF). Returns once the relay
/// has been asked to stop.
pub async fn run(handle: RelayHandle, debug: Arc<DebugControl>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !dispatch(&handle, &debug, line).await {
            break;
        }
    }
}

/// Returns false once the console should stop.
async fn dispatch(handle: &RelayHandle, debug: &DebugControl, line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or("");
    let arg1 = parts.next();
    let rest = parts.next();

    match command {
        "help" => print_help(),
        "status" => {
            if let Some(status) = handle.status().await {
                println!(
                    "{} rooms, {} clients, {} connections.",
                    status.rooms.len(),
                    status.clients,
                    status.connections
                );
                for room in &status.rooms {
                    println!(
                        "| {}: {} clients, type {}, {} in / {} out, up {}s",
                        room.id,
                        room.clients.len(),
                        room.game_type.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
                        room.to_host,
                        room.to_clients,
                        room.uptime_secs
                    );
                }
            }
        }
        "rooms" => {
            if let Some(status) = handle.status().await {
                if status.rooms.is_empty() {
                    println!("No created rooms.");
                }
                for room in &status.rooms {
                    println!(
                        "| Room {}: [{} clients, type {}{}{}]",
                        room.id,
                        room.clients.len(),
                        room.game_type.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
                        if room.is_public { ", public" } else { "" },
                        if room.is_protected { ", protected" } else { "" },
                    );
                    println!("| | [H] Connection {} - {}", room.host_con, room.host_addr);
                    for (con, addr) in &room.clients {
                        println!("| | [C] Connection {con} - {addr}");
                    }
                }
            }
        }
        "close" => match arg1.map(RoomId::from_short) {
            Some(Ok(room)) => {
                if handle.close_room(room).await {
                    println!("Room {room} closed.");
                } else {
                    println!("Room not found.");
                }
            }
            _ => println!("Usage: close <roomId>"),
        },
        "say" | "alert" => {
            let (Some(target), Some(text)) = (arg1, rest) else {
                println!("Usage: {command} <roomId|all> <text...>");
                return true;
            };
            let target = match parse_target(target) {
                Ok(target) => target,
                Err(()) => {
                    println!("Invalid room id.");
                    return true;
                }
            };
            let sent = if command == "say" {
                handle.say(target, text).await
            } else {
                handle.alert(target, text).await
            };
            println!("{}", if sent { "Sent." } else { "Room not found." });
        }
        "blacklist" => match (arg1, rest.map(str::parse::<IpAddr>)) {
            (None, _) => {
                let list = handle.blacklist().await;
                if list.is_empty() {
                    println!("Blacklist is empty.");
                } else {
                    println!("Blacklist: [total: {}]", list.len());
                    for ip in list {
                        println!("| {ip}");
                    }
                }
            }
            (Some("add"), Some(Ok(ip))) => {
                if handle.blacklist_add(ip).await {
                    println!("IP added to blacklist.");
                } else {
                    println!("IP already blacklisted.");
                }
            }
            (Some("del"), Some(Ok(ip))) => {
                if handle.blacklist_remove(ip).await {
                    println!("IP removed from blacklist.");
                } else {
                    println!("IP not blacklisted.");
                }
            }
            _ => println!("Usage: blacklist [add|del] [IP]"),
        },
        "spam-limit" => match arg1.map(str::parse::<u32>) {
            None => println!("Usage: spam-limit <amount> (0 to disable)"),
            Some(Ok(limit)) => {
                handle.set_spam_limit(limit).await;
                if limit == 0 {
                    println!("Packet spam limit disabled.");
                } else {
                    println!("Packet spam limit set to {limit} packets per 3 seconds.");
                }
            }
            Some(Err(_)) => println!("Invalid input."),
        },
        "join-limit" => match arg1.map(str::parse::<u32>) {
            None => println!("Usage: join-limit <amount> (0 to disable)"),
            Some(Ok(limit)) => {
                handle.set_join_limit(limit).await;
                if limit == 0 {
                    println!("Join request limit disabled.");
                } else {
                    println!("Join request limit set to {limit} requests per minute.");
                }
            }
            Some(Err(_)) => println!("Invalid input."),
        },
        "refresh" => refresh(handle, arg1, rest).await,
        "debug" => match arg1 {
            None => println!(
                "Debug log level is {}.",
                if debug.get() { "enabled" } else { "disabled" }
            ),
            Some("on") => {
                debug.set(true);
                println!("Debug log level enabled.");
            }
            Some("off") => {
                debug.set(false);
                println!("Debug log level disabled.");
            }
            _ => println!("Usage: debug [on|off]"),
        },
        "exit" => {
            println!("Shutting down.");
            handle.stop().await;
            return false;
        }
        _ => println!("Unknown command. Type 'help' for the command list."),
    }
    true
}

async fn refresh(handle: &RelayHandle, arg1: Option<&str>, rest: Option<&str>) {
    let mut rest_parts = rest.unwrap_or("").split(' ').filter(|s| !s.is_empty());
    let target = rest_parts.next();
    let force = rest_parts.next() == Some("force");

    match arg1 {
        Some("room") => {
            let Some(Ok(room)) = target.map(RoomId::from_short) else {
                println!("A room id must be provided.");
                return;
            };
            match handle.refresh_room(room, force).await {
                RefreshOutcome::Requested => println!("State of room {room} has been requested."),
                RefreshOutcome::AlreadyPending => {
                    println!("A request is already pending, please wait a moment.")
                }
                RefreshOutcome::NotFound => println!("Room {room} not found."),
                RefreshOutcome::NotAllowed => println!(
                    "The room does not allow state requests. (Use 'force' to request anyway)"
                ),
            }
        }
        Some("list") => {
            let game_type = match target.map(str::parse::<GameType>) {
                None => None,
                Some(Ok(t)) => Some(t),
                Some(Err(_)) => {
                    println!("Invalid type label.");
                    return;
                }
            };
            match handle.refresh_list(game_type, force).await {
                RefreshOutcome::Requested => println!("Refreshing... This can take a moment."),
                RefreshOutcome::AlreadyPending => {
                    println!("A refresh is already in progress. (Use 'force' to refresh anyway)")
                }
                RefreshOutcome::NotFound => println!("No room with that type found."),
                RefreshOutcome::NotAllowed => unreachable!("list refresh has no config gate"),
            }
        }
        _ => println!("Usage: refresh <room|list> [id|type] [force]"),
    }
}

fn parse_target(raw: &str) -> Result<Option<RoomId>, ()> {
    if raw == "all" {
        Ok(None)
    } else {
        RoomId::from_short(raw).map(Some).map_err(|_| ())
    }
}

fn print_help() {
    println!("Commands:");
    println!("| help                              - This list.");
    println!("| status                            - Server and room counters.");
    println!("| rooms                             - Created rooms and their members.");
    println!("| close <roomId>                    - Close a room.");
    println!("| say <roomId|all> <text...>        - Message a room (or all).");
    println!("| alert <roomId|all> <text...>      - Popup a room host (or all).");
    println!("| blacklist [add|del] [IP]          - Show or edit the IP blacklist.");
    println!("| spam-limit <amount>               - Packets per 3s; 0 disables.");
    println!("| join-limit <amount>               - Joins per minute; 0 disables.");
    println!("| refresh <room|list> [id|type] [force] - Refresh states or lists.");
    println!("| debug [on|off]                    - Toggle debug logging.");
    println!("| exit                              - Stop the server.");
}
