use crate::message::Request;

/// Substitutes `{field}` placeholders with request fields.
///
/// Known fields: `name`, `stream_id`, `sequence_id`, `message_id`, `ctime`,
/// `stime`, `rtime`, `rcount`, `worker_id`, `load`. `{{` and `}}` produce
/// literal braces, unknown placeholders are left as written.
pub fn render(template: &str, request: &Request) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('{') {
            match tail.find('}') {
                Some(end) => {
                    let key = &tail[1..end];
                    match field(key, request) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&tail[..=end]),
                    }
                    rest = &tail[end + 1..];
                }
                None => {
                    out.push_str(tail);
                    rest = "";
                }
            }
        } else {
            out.push('}');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

fn field(key: &str, request: &Request) -> Option<String> {
    let value = match key {
        "name" => request.name.clone(),
        "stream_id" => request.stream_id.to_string(),
        "sequence_id" => request.sequence_id.to_string(),
        "message_id" => request.message_id.to_string(),
        "ctime" => request.ctime.to_string(),
        "stime" => request.stime.to_string(),
        "rtime" => request.rtime.to_string(),
        "rcount" => request.rcount.to_string(),
        "worker_id" => request.worker_id.to_string(),
        "load" => request
            .load
            .iter()
            .map(|l| format!("{}={}", l.kind, l.value))
            .collect::<Vec<_>>()
            .join(","),
        _ => return None,
    };
    Some(value)
}
