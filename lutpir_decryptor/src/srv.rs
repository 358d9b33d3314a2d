use crate::{key_container::KeyContainer, pir_solver::calc_pir_queries};
use lutpir_common::{
    error::LutPIRError,
    framing::{error_response, ok_response, read_frame, write_frame},
    he::{HeScheme, KeyKind, SchemeParams, Serializable},
    listener::{ServerHandle, spawn_accept_loop},
    packet::{ControlCode, MidResultRequest, NewKeysResponse, key_id_from_bytes},
    state::{DecEvent, StateContext},
};
use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
};
use tracing::{debug, warn};

/// Request/response front end of a decryptor: serves key bundles to Users, evaluation keys and mid-result
/// exchanges to computation servers.
pub struct DecServer<S: HeScheme> {
    listener: TcpListener,
    keys: Arc<KeyContainer<S>>,
}

impl<S: HeScheme + 'static> DecServer<S> {
    pub fn bind(addr: &str, keys: Arc<KeyContainer<S>>) -> Result<Self, LutPIRError> {
        Ok(DecServer {
            listener: TcpListener::bind(addr)?,
            keys,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LutPIRError> {
        Ok(self.listener.local_addr()?)
    }

    /// Starts serving on background threads.
    pub fn spawn(self) -> Result<ServerHandle, LutPIRError> {
        let keys = self.keys;
        spawn_accept_loop(self.listener, "dec", move |stream| handle_connection::<S>(stream, &keys))
    }
}

fn handle_connection<S: HeScheme>(mut stream: TcpStream, keys: &KeyContainer<S>) {
    let peer = stream.peer_addr().map(|addr| addr.to_string()).unwrap_or_default();
    let mut ctx = StateContext::<DecEvent>::new();

    loop {
        let (code, payload) = match read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "dropping connection");
                break;
            }
        };

        let response = match dispatch(code, &payload, keys, &mut ctx) {
            Ok(body) => ok_response(&body),
            Err(e) => {
                warn!(%peer, ?code, error = %e, "request failed");
                error_response(&e)
            }
        };

        if let Err(e) = write_frame(&mut stream, ControlCode::Response, &response) {
            warn!(%peer, error = %e, "failed to send response");
            break;
        }
    }

    debug!(%peer, events = ctx.num_events(), last_event = ?ctx.last_event(), "connection closed");
}

fn dispatch<S: HeScheme>(code: ControlCode, payload: &[u8], keys: &KeyContainer<S>, ctx: &mut StateContext<DecEvent>) -> Result<Vec<u8>, LutPIRError> {
    let artifact_kind = match code {
        ControlCode::PubKey => Some(KeyKind::PublicKey),
        ControlCode::GaloisKey => Some(KeyKind::GaloisKeys),
        ControlCode::RelinKey => Some(KeyKind::RelinKeys),
        ControlCode::Param => Some(KeyKind::Params),
        _ => None,
    };
    if let Some(kind) = artifact_kind {
        ctx.on_event(DecEvent::KeyRequested(kind));
        return keys.get(key_id_from_bytes(payload)?, kind);
    }

    match code {
        ControlCode::NewKeys => {
            ctx.on_event(DecEvent::NewKeys);

            let params = SchemeParams::from_bytes(payload)?;
            let key_id = keys.new_keys(&params)?;
            let secret_key = keys.get(key_id, KeyKind::SecretKey)?;

            Ok(NewKeysResponse { key_id, secret_key }.to_bytes())
        }
        ControlCode::DeleteKeys => {
            ctx.on_event(DecEvent::DeleteKeys);

            keys.delete_keys(key_id_from_bytes(payload)?)?;
            Ok(Vec::new())
        }
        ControlCode::MidResult => {
            ctx.on_event(DecEvent::MidResult);

            let request = MidResultRequest::from_bytes(payload)?;
            let response = calc_pir_queries(keys, &request, &mut keys.fork_rng())?;

            Ok(response.to_bytes())
        }
        code => Err(LutPIRError::UnknownControlCode(code as u64)),
    }
}
