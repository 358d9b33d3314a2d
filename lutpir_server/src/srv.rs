use crate::{
    calc_manager::CalcManager,
    query::Query,
    result::{QueryResult, ResultStatus},
};
use lutpir_common::{
    branch_opt_util,
    error::LutPIRError,
    framing::{error_response, ok_response, read_frame, write_frame},
    listener::{ServerHandle, spawn_accept_loop},
    packet::{ControlCode, QueryRequest, ResultRequest, ResultResponse, query_id_to_bytes},
    state::{CsEvent, StateContext},
};
use std::{
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, warn};

/// Request/response front end of a computation server: accepts User queries and serves their results.
pub struct CsServer {
    listener: TcpListener,
    manager: Arc<CalcManager>,
}

impl CsServer {
    pub fn bind(addr: &str, manager: Arc<CalcManager>) -> Result<CsServer, LutPIRError> {
        Ok(CsServer {
            listener: TcpListener::bind(addr)?,
            manager,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LutPIRError> {
        Ok(self.listener.local_addr()?)
    }

    /// Starts serving on background threads.
    pub fn spawn(self) -> Result<ServerHandle, LutPIRError> {
        let manager = self.manager;
        spawn_accept_loop(self.listener, "cs", move |stream| handle_connection(stream, &manager))
    }
}

fn handle_connection(mut stream: TcpStream, manager: &CalcManager) {
    let peer = stream.peer_addr().map(|addr| addr.to_string()).unwrap_or_default();
    let mut ctx = StateContext::<CsEvent>::new();

    loop {
        let (code, payload) = match read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "dropping connection");
                break;
            }
        };

        let response = match dispatch(code, &payload, manager, &mut ctx) {
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

fn dispatch(code: ControlCode, payload: &[u8], manager: &CalcManager, ctx: &mut StateContext<CsEvent>) -> Result<Vec<u8>, LutPIRError> {
    match code {
        ControlCode::Query => {
            ctx.on_event(CsEvent::QueryReceived);

            let request = QueryRequest::from_bytes(payload)?;
            let query_id = manager.push_query(Query::from(request))?;

            Ok(query_id_to_bytes(query_id))
        }
        ControlCode::Result => {
            ctx.on_event(CsEvent::ResultRequested);

            let request = ResultRequest::from_bytes(payload)?;
            let result = if request.wait_msec == 0 {
                manager.try_get_result(request.query_id)
            } else {
                manager.pop_result_timeout(request.query_id, Duration::from_millis(request.wait_msec as u64))
            };

            Ok(to_result_response(result, &request)?.to_bytes())
        }
        code => Err(LutPIRError::UnknownControlCode(code as u64)),
    }
}

fn to_result_response(result: Option<QueryResult>, request: &ResultRequest) -> Result<ResultResponse, LutPIRError> {
    let Some(result) = result else {
        return Ok(ResultResponse::NotReady);
    };

    // The result is consumed either way; one fetched under foreign parameters is not handed out.
    if branch_opt_util::unlikely(result.params != request.params) {
        return Err(LutPIRError::SchemeParamsMismatch);
    }

    match (result.status, result.ciphertext) {
        (ResultStatus::Success, Some(ciphertext)) => Ok(ResultResponse::Ready(ciphertext)),
        _ => Ok(ResultResponse::Failed),
    }
}

#[cfg(test)]
mod test {
    use super::CsServer;
    use crate::{
        calc_manager::{CalcConfig, CalcManager},
        lut::{LookupTable, OneInputTable},
    };
    use lutpir_common::{
        error::LutPIRError,
        framing::Connection,
        he::SchemeParams,
        packet::{ControlCode, FuncNo, QueryRequest, ResultRequest, ResultResponse, query_id_from_bytes},
        params::RetryPolicy,
    };
    use std::sync::Arc;

    #[test]
    fn queries_are_admitted_and_polled_over_tcp() {
        let lut = Arc::new(LookupTable::new(Some(OneInputTable::from_fn(vec![1, 2, 3], |x| x)), None).unwrap());
        let manager = Arc::new(CalcManager::new(
            lut,
            CalcConfig {
                max_concurrent_queries: 1,
                ..Default::default()
            },
        ));

        let server = CsServer::bind("127.0.0.1:0", manager.clone()).unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let mut handle = server.spawn().unwrap();

        let mut conn = Connection::connect(&addr, RetryPolicy::default()).unwrap();
        let query = QueryRequest {
            key_id: 1,
            func_no: FuncNo::OneInput,
            params: SchemeParams::default(),
            inputs: vec![vec![0u8; 4]],
        };

        let query_id = query_id_from_bytes(&conn.request(ControlCode::Query, &query.to_bytes()).unwrap()).unwrap();
        assert_eq!(
            conn.request(ControlCode::Query, &query.to_bytes()),
            Err(LutPIRError::QueryAdmissionRejected)
        );

        // No worker runs, so the result never becomes ready.
        let poll = ResultRequest {
            query_id,
            wait_msec: 0,
            params: SchemeParams::default(),
        };
        let response = conn.request(ControlCode::Result, &poll.to_bytes()).unwrap();
        assert_eq!(ResultResponse::from_bytes(&response), Ok(ResultResponse::NotReady));

        assert!(matches!(conn.request(ControlCode::NewKeys, &[]), Err(LutPIRError::Remote(_))));

        handle.stop();
        assert_eq!(manager.query_count(), 1);
    }
}
