use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use topicmesh_frame::{DataEnvelope, PeerSummary, Role, TopicSummary};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PublishedOutput<'a> {
    topic: &'a str,
    seq: u64,
    delivered: usize,
}

pub fn print_published(topic: &str, seq: u64, delivered: usize, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            let out = PublishedOutput {
                topic,
                seq,
                delivered,
            };
            println!("{}", to_json(&out));
        }
        OutputFormat::Table => {
            let mut table = new_table(vec!["TOPIC", "SEQ", "DELIVERED"]);
            table.add_row(vec![topic.to_string(), seq.to_string(), delivered.to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("topic={topic} seq={seq} delivered={delivered}");
        }
    }
}

pub fn print_data(data: &DataEnvelope, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(data)),
        OutputFormat::Table => {
            let mut table = new_table(vec!["TOPIC", "SOURCE", "SENT", "PAYLOAD"]);
            table.add_row(vec![
                data.topic.clone(),
                data.source_peer.clone(),
                data.send_timestamp.to_string(),
                data.payload.to_string(),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "topic={} from={} id={} sent={} payload={}",
                data.topic, data.source_peer, data.message_id, data.send_timestamp, data.payload
            );
        }
        OutputFormat::Raw => {
            print_raw(format!("{}\n", data.payload).as_bytes());
        }
    }
}

pub fn print_peers(peers: &[PeerSummary], format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => println!("{}", to_json(peers)),
        OutputFormat::Table => {
            let mut table = new_table(vec!["PEER", "ADDRESS", "ROLES", "TOPICS"]);
            for peer in peers {
                table.add_row(vec![
                    peer.peer_name.clone(),
                    peer.address.to_string(),
                    roles(&peer.roles),
                    peer.topics.join(", "),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for peer in peers {
                println!(
                    "{} {} roles={} topics={}",
                    peer.peer_name,
                    peer.address,
                    roles(&peer.roles),
                    peer.topics.join(",")
                );
            }
        }
    }
}

pub fn print_topics(topics: &[TopicSummary], format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => println!("{}", to_json(topics)),
        OutputFormat::Table => {
            let mut table = new_table(vec!["TOPIC", "PUBLISHERS", "SUBSCRIBERS"]);
            for topic in topics {
                table.add_row(vec![
                    topic.topic.clone(),
                    topic.publishers.join(", "),
                    topic.subscribers.join(", "),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for topic in topics {
                println!(
                    "{} publishers={} subscribers={}",
                    topic.topic,
                    topic.publishers.join(","),
                    topic.subscribers.join(",")
                );
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(|role| match role {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}
