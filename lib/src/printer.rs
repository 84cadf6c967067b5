//! Output rendering for the CLI: a human table form and a machine JSON
//! form, switched by `--json`.

use serde_json::json;

use crate::package::PackageMeta;
use crate::runtime::Container;
use crate::service::{QueryReply, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Printer {
    Human,
    Json,
}

impl Printer {
    pub fn print_reply(&self, reply: &Reply) {
        match self {
            Printer::Human => println!("{}", reply.message),
            Printer::Json => {
                let obj = json!({ "code": reply.code, "message": reply.message });
                println!("{obj}");
            }
        }
    }

    /// Render a query reply whose payload is a descriptor array.
    pub fn print_meta_reply(&self, reply: &QueryReply) {
        match self {
            Printer::Json => {
                let result: serde_json::Value =
                    serde_json::from_str(&reply.result).unwrap_or(serde_json::Value::Null);
                let obj = json!({
                    "code": reply.code,
                    "message": reply.message,
                    "result": result,
                });
                println!("{obj}");
            }
            Printer::Human => {
                let metas: Vec<PackageMeta> =
                    serde_json::from_str(&reply.result).unwrap_or_default();
                if metas.is_empty() {
                    println!("{}", reply.message);
                    return;
                }
                println!(
                    "{:<32}{:<24}{:<16}{:<12}{:<16}{:<12}{}",
                    "appId", "name", "version", "arch", "channel", "module", "description"
                );
                for meta in metas {
                    println!(
                        "{:<32}{:<24}{:<16}{:<12}{:<16}{:<12}{}",
                        truncate(&meta.app_id, 30),
                        truncate(&meta.name, 22),
                        truncate(&meta.version, 14),
                        meta.arch,
                        truncate(&meta.channel, 14),
                        truncate(&meta.module, 10),
                        truncate(&meta.description, 60),
                    );
                }
            }
        }
    }

    pub fn print_containers(&self, reply: &QueryReply) {
        match self {
            Printer::Json => self.print_meta_reply(reply),
            Printer::Human => {
                let containers: Vec<Container> =
                    serde_json::from_str(&reply.result).unwrap_or_default();
                if containers.is_empty() {
                    println!("no running containers");
                    return;
                }
                println!(
                    "{:<36}{:<10}{:<48}{}",
                    "ContainerID", "Pid", "Package", "Path"
                );
                for c in containers {
                    println!(
                        "{:<36}{:<10}{:<48}{}",
                        c.id, c.pid, c.package_name, c.working_directory
                    );
                }
            }
        }
    }

    pub fn print_error(&self, code: i32, message: &str) {
        match self {
            Printer::Human => eprintln!("code: {code} message: {message}"),
            Printer::Json => {
                let obj = json!({ "code": code, "message": message });
                println!("{obj}");
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(2)).collect();
        out.push_str("..");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-rather-long-identifier", 10), "a-rather..");
    }
}
