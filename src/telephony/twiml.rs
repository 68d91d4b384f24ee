//! TwiML answer for incoming calls
//!
//! Connects the call to our media stream WebSocket and passes the caller's
//! number through as a stream parameter, since the `start` frame does not
//! carry it otherwise.

use super::protocol::CALLER_PARAMETER;

/// Build the `<Connect><Stream>` response for `stream_url`
pub fn stream_twiml(stream_url: &str, caller: Option<&str>) -> String {
    let parameter = caller
        .filter(|c| !c.is_empty())
        .map(|c| {
            format!(
                "\n      <Parameter name=\"{}\" value=\"{}\" />",
                CALLER_PARAMETER,
                escape_xml(c)
            )
        })
        .unwrap_or_default();

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Response>\n  \
         <Connect>\n    \
         <Stream url=\"{}\">{}\n    \
         </Stream>\n  \
         </Connect>\n\
         </Response>\n",
        escape_xml(stream_url),
        parameter
    )
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twiml_with_caller() {
        let xml = stream_twiml("wss://bridge.example.com/media-stream", Some("+15551234567"));
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<Stream url=\"wss://bridge.example.com/media-stream\">"));
        assert!(xml.contains("<Parameter name=\"callerNumber\" value=\"+15551234567\" />"));
        assert!(xml.contains("</Connect>"));
    }

    #[test]
    fn test_twiml_without_caller() {
        let xml = stream_twiml("wss://h/media-stream", None);
        assert!(!xml.contains("Parameter"));
        assert!(xml.contains("</Stream>"));
    }

    #[test]
    fn test_values_are_escaped() {
        let xml = stream_twiml("wss://h/media-stream?a=1&b=2", Some("\"<anon>\""));
        assert!(xml.contains("a=1&amp;b=2"));
        assert!(xml.contains("value=\"&quot;&lt;anon&gt;&quot;\""));
    }
}
