use crate::server::dispatcher::Dispatcher;

/// Commands accepted on line-oriented admin connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Status,
    Workers,
    Version,
    /// Parsed and acknowledged; queue caps are not enforced per function.
    MaxQueue,
    Shutdown,
    Unknown(String),
}

/// Reply text plus whether the server should begin shutting down.
#[derive(Debug)]
pub struct AdminReply {
    pub text: String,
    pub shutdown: bool,
}

pub fn parse(line: &str) -> AdminCommand {
    let mut words = line.split_ascii_whitespace();
    match words.next() {
        Some("status") => AdminCommand::Status,
        Some("workers") => AdminCommand::Workers,
        Some("version") => AdminCommand::Version,
        Some("maxqueue") => AdminCommand::MaxQueue,
        Some("shutdown") => AdminCommand::Shutdown,
        Some(other) => AdminCommand::Unknown(other.to_string()),
        None => AdminCommand::Unknown(String::new()),
    }
}

pub fn respond(dispatcher: &Dispatcher, command: &AdminCommand) -> AdminReply {
    match command {
        AdminCommand::Status => {
            let mut text = String::new();
            for line in dispatcher.status_lines() {
                text.push_str(&line);
                text.push('\n');
            }
            text.push_str(".\n");
            AdminReply {
                text,
                shutdown: false,
            }
        }
        AdminCommand::Workers => {
            let mut text = String::new();
            for line in dispatcher.worker_lines() {
                text.push_str(&line);
                text.push('\n');
            }
            text.push_str(".\n");
            AdminReply {
                text,
                shutdown: false,
            }
        }
        AdminCommand::Version => AdminReply {
            text: format!("OK {}\n", env!("CARGO_PKG_VERSION")),
            shutdown: false,
        },
        AdminCommand::MaxQueue => AdminReply {
            text: "OK\n".to_string(),
            shutdown: false,
        },
        AdminCommand::Shutdown => AdminReply {
            text: "OK\n".to_string(),
            shutdown: true,
        },
        AdminCommand::Unknown(word) => AdminReply {
            text: format!("ERR unknown_command {word}\n"),
            shutdown: false,
        },
    }
}
