use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write;

use crate::message::Stat;
use crate::metrics::HostMetric;

/// Text layout a sink expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// Comma separated line for logs and files
    Plain,
    /// InfluxDB line protocol
    InfluxLine,
    /// Prometheus text exposition
    Prometheus,
}

/// Which side of the exchange produced the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderContext {
    pub role: Role,
    pub hostname: String,
}

impl RenderContext {
    pub fn new(role: Role, hostname: impl Into<String>) -> Self {
        Self {
            role,
            hostname: hostname.into(),
        }
    }
}

/// A record that can be turned into sink text.
pub trait Render: Send + Sync {
    fn render(&self, format: LineFormat, ctx: &RenderContext) -> String;
}

impl Render for Stat {
    fn render(&self, format: LineFormat, ctx: &RenderContext) -> String {
        let req = &self.request;
        let res = &self.response;
        match format {
            LineFormat::Plain => {
                if req.is_retransmit() {
                    format!(
                        "{},{},{},{},{},{},{},{},{},rtt={}",
                        timestamp_str(self.timestamp),
                        res.status_code,
                        req.name,
                        req.message_id,
                        req.ctime,
                        req.rtime,
                        self.cdelta(),
                        self.rdelta(),
                        req.rcount,
                        self.rtt()
                    )
                } else {
                    format!(
                        "{},{},{},{},{},{},rtt={}",
                        timestamp_str(self.timestamp),
                        res.status_code,
                        req.name,
                        req.message_id,
                        req.ctime,
                        self.cdelta(),
                        self.rtt()
                    )
                }
            }
            LineFormat::InfluxLine => {
                let mut line = format!(
                    "{}stats,hostname={},status={},name={},sid={},wid={},qid={} mid={}i,ctime={}i,cdelta={}i,sdelta={}i,pdelta={}i,bdelta={}i,rtt={}i",
                    ctx.role.as_str(),
                    escape_tag(&ctx.hostname),
                    res.status_code,
                    escape_tag(&req.name),
                    req.stream_id,
                    req.worker_id,
                    req.sequence_id,
                    req.message_id,
                    req.ctime,
                    self.cdelta(),
                    self.sdelta(),
                    self.pdelta(),
                    self.bdelta(),
                    self.rtt()
                );
                if req.is_retransmit() {
                    let _ = write!(
                        line,
                        ",rtime={}i,rdelta={}i,rcount={}i",
                        req.rtime,
                        self.rdelta(),
                        req.rcount
                    );
                }
                let _ = write!(line, " {}", self.timestamp);
                line
            }
            LineFormat::Prometheus => format!(
                "# TYPE nudge_message_rtt_nanoseconds gauge\nnudge_message_rtt_nanoseconds{{name=\"{}\",stream_id=\"{}\",worker_id=\"{}\",message_id=\"{}\",status=\"{}\",rcount=\"{}\"}} {}\n",
                escape_label(&req.name),
                req.stream_id,
                req.worker_id,
                req.message_id,
                res.status_code,
                req.rcount,
                self.rtt()
            ),
        }
    }
}

impl Render for HostMetric {
    fn render(&self, format: LineFormat, ctx: &RenderContext) -> String {
        match format {
            LineFormat::Plain => format!(
                "{},{},{:.1},{:.1}",
                timestamp_str(self.timestamp),
                self.hostname,
                self.cpu_usage,
                self.mem_percent()
            ),
            LineFormat::InfluxLine => {
                let host = escape_tag(&self.hostname);
                format!(
                    "cpu,hostname={host},mode={role}metrics usage={cpu} {ts}\nmem,hostname={host},mode={role}metrics used={used}i,total={total}i,percent={percent} {ts}",
                    host = host,
                    role = ctx.role.as_str(),
                    cpu = self.cpu_usage,
                    used = self.mem_used,
                    total = self.mem_total,
                    percent = self.mem_percent(),
                    ts = self.timestamp
                )
            }
            LineFormat::Prometheus => format!(
                "# TYPE nudge_cpu_usage_percent gauge\nnudge_cpu_usage_percent{{hostname=\"{host}\"}} {cpu}\n# TYPE nudge_memory_used_percent gauge\nnudge_memory_used_percent{{hostname=\"{host}\"}} {mem}\n",
                host = escape_label(&self.hostname),
                cpu = self.cpu_usage,
                mem = self.mem_percent()
            ),
        }
    }
}

fn timestamp_str(ns: u64) -> String {
    DateTime::<Utc>::from_timestamp_nanos(ns as i64).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Escapes commas, spaces and equals signs in an InfluxDB tag value.
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | ' ' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Request, Response};

    fn ctx() -> RenderContext {
        RenderContext::new(Role::Client, "host-1")
    }

    fn stat() -> Stat {
        let mut request = Request::new("client a", 3, 1, 7, Vec::new());
        request.ctime = 1_000;
        request.stime = 1_100;
        request.worker_id = 2;
        Stat::new(request, Response::ok(1_200, 1_300), 1_500)
    }

    #[test]
    fn test_plain_line() {
        let line = stat().render(LineFormat::Plain, &ctx());
        assert!(line.ends_with(",0,client a,7,1000,100,rtt=500"), "{}", line);
    }

    #[test]
    fn test_plain_retransmit_line() {
        let mut stat = stat();
        stat.request.rcount = 2;
        stat.request.rtime = 1_050;
        let line = stat.render(LineFormat::Plain, &ctx());
        assert!(line.ends_with(",0,client a,7,1000,1050,100,50,2,rtt=500"), "{}", line);
    }

    #[test]
    fn test_influx_line() {
        let line = stat().render(LineFormat::InfluxLine, &ctx());
        assert_eq!(
            line,
            "clientstats,hostname=host-1,status=0,name=client\\ a,sid=3,wid=2,qid=1 mid=7i,ctime=1000i,cdelta=100i,sdelta=100i,pdelta=100i,bdelta=200i,rtt=500i 1500"
        );
    }

    #[test]
    fn test_prometheus_text() {
        let text = stat().render(LineFormat::Prometheus, &ctx());
        assert!(text.starts_with("# TYPE nudge_message_rtt_nanoseconds gauge\n"));
        assert!(text.contains("message_id=\"7\""));
        assert!(text.ends_with("} 500\n"));
    }

    #[test]
    fn test_host_metric_influx() {
        let metric = HostMetric {
            timestamp: 10,
            hostname: "h".to_string(),
            cpu_usage: 12.5,
            mem_used: 1,
            mem_total: 4,
        };
        let text = metric.render(LineFormat::InfluxLine, &RenderContext::new(Role::Server, "h"));
        assert_eq!(
            text,
            "cpu,hostname=h,mode=servermetrics usage=12.5 10\nmem,hostname=h,mode=servermetrics used=1i,total=4i,percent=25 10"
        );
    }

    #[test]
    fn test_escape_label() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }
}
