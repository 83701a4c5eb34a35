//! WebSocket handshake material: endpoint URIs and the bearer subprotocol.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use url::Url;

/// Subprotocol implementing the remote-command attach framing.
pub const ATTACH_SUBPROTOCOL: &str = "v4.channel.k8s.io";

/// Companion subprotocol offered on watch connections. The API server
/// requires at least one entry besides the bearer token.
pub const WATCH_SUBPROTOCOL: &str = "garden";

const BEARER_PREFIX: &str = "base64url.bearer.authorization.k8s.io.";

/// Encodes a bearer token as a synthetic subprotocol entry.
///
/// The WebSocket handshake cannot carry arbitrary headers from every
/// client, so the API server accepts the token smuggled through the
/// subprotocol list instead of an `Authorization` header.
pub fn bearer_subprotocol(token: &str) -> String {
    format!("{BEARER_PREFIX}{}", URL_SAFE_NO_PAD.encode(token))
}

/// Subprotocol list for a pod watch connection.
pub fn watch_subprotocols(token: &str) -> Vec<String> {
    vec![WATCH_SUBPROTOCOL.to_string(), bearer_subprotocol(token)]
}

/// Subprotocol list for an attach connection.
pub fn attach_subprotocols(token: &str) -> Vec<String> {
    vec![ATTACH_SUBPROTOCOL.to_string(), bearer_subprotocol(token)]
}

/// `wss://` URI of the watch endpoint filtered to exactly one named pod.
pub fn watch_uri(
    kube_api_server: &str,
    namespace: &str,
    pod_name: &str,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("wss://{kube_api_server}"))?;
    url.path_segments_mut()
        .map_err(|()| url::ParseError::SetHostOnCannotBeABaseUrl)?
        .extend(["api", "v1", "namespaces", namespace, "pods"]);
    url.query_pairs_mut()
        .append_pair("fieldSelector", &format!("metadata.name={pod_name}"))
        .append_pair("watch", "true");
    Ok(url)
}

/// `wss://` URI of the interactive attach endpoint for one container.
pub fn attach_uri(
    kube_api_server: &str,
    namespace: &str,
    pod_name: &str,
    container: &str,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("wss://{kube_api_server}"))?;
    url.path_segments_mut()
        .map_err(|()| url::ParseError::SetHostOnCannotBeABaseUrl)?
        .extend(["api", "v1", "namespaces", namespace, "pods", pod_name, "attach"]);
    url.query_pairs_mut()
        .append_pair("container", container)
        .append_pair("stdin", "true")
        .append_pair("stdout", "true")
        .append_pair("tty", "true");
    Ok(url)
}
