//! Line commands read from the controller's stdin.

use serde_json::Value;

pub const HELP: &str = "\
commands:
  send <type> <json> [target]   send a command (broadcast without target)
  list                          show connected agents
  kick <peer_id>                disconnect an agent (direct mode only)
  help                          this text
  quit                          stop the controller";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Send {
        message_type: String,
        payload: Value,
        target: Option<String>,
    },
    List,
    Kick(String),
    Help,
    Quit,
}

/// Parse one input line. `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line
        .split_once(char::is_whitespace)
        .map(|(v, r)| (v, r.trim()))
        .unwrap_or((line, ""));

    let command = match verb {
        "send" => parse_send(rest)?,
        "list" | "ls" => ConsoleCommand::List,
        "kick" => {
            if rest.is_empty() || rest.contains(char::is_whitespace) {
                return Err("usage: kick <peer_id>".to_string());
            }
            ConsoleCommand::Kick(rest.to_string())
        }
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command '{other}' (try 'help')")),
    };
    Ok(Some(command))
}

/// `<type> <json> [target]`. The JSON may contain spaces; a trailing bare
/// word after it is the target.
fn parse_send(rest: &str) -> Result<ConsoleCommand, String> {
    const USAGE: &str = "usage: send <type> <json> [target]";
    let (message_type, body) = rest.split_once(char::is_whitespace).ok_or(USAGE)?;
    let body = body.trim();

    if let Ok(payload) = serde_json::from_str::<Value>(body) {
        return Ok(ConsoleCommand::Send {
            message_type: message_type.to_string(),
            payload,
            target: None,
        });
    }
    let (json, target) = body.rsplit_once(char::is_whitespace).ok_or(USAGE)?;
    let payload = serde_json::from_str::<Value>(json.trim())
        .map_err(|e| format!("invalid JSON payload: {e}"))?;
    Ok(ConsoleCommand::Send {
        message_type: message_type.to_string(),
        payload,
        target: Some(target.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_broadcast() {
        assert_eq!(
            parse(r#"send start_scan {"urls": ["a", "b"]}"#).unwrap(),
            Some(ConsoleCommand::Send {
                message_type: "start_scan".into(),
                payload: json!({"urls": ["a", "b"]}),
                target: None,
            })
        );
    }

    #[test]
    fn test_send_with_target() {
        assert_eq!(
            parse(r#"send stop {"now": true} agent-1"#).unwrap(),
            Some(ConsoleCommand::Send {
                message_type: "stop".into(),
                payload: json!({"now": true}),
                target: Some("agent-1".into()),
            })
        );
    }

    #[test]
    fn test_send_errors() {
        assert!(parse("send").is_err());
        assert!(parse("send stop").is_err());
        assert!(parse("send stop {oops} agent-1").unwrap_err().contains("invalid JSON"));
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse("  ").unwrap(), None);
        assert_eq!(parse("list").unwrap(), Some(ConsoleCommand::List));
        assert_eq!(
            parse("kick agent-1").unwrap(),
            Some(ConsoleCommand::Kick("agent-1".into()))
        );
        assert!(parse("kick").is_err());
        assert_eq!(parse("quit").unwrap(), Some(ConsoleCommand::Quit));
        assert!(parse("reboot").is_err());
    }
}
