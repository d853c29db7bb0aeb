use super::*;
use crate::{NamedFile, Packager, Sha256Packager, UnverifiedIdentity};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use ed25519_dalek::{Signature, Verifier};
use futures::stream;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct ReceivedChunk {
    did: String,
    signature: Vec<u8>,
    body: Vec<u8>,
}

#[derive(Clone, Default)]
struct UploadState {
    received: Arc<Mutex<Vec<ReceivedChunk>>>,
}

fn count_framed_blocks(mut body: &[u8]) -> usize {
    let mut blocks = 0;
    while body.len() >= 2 {
        let address_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let data_start = 2 + address_len + 4;
        let len_bytes: [u8; 4] = body[2 + address_len..data_start]
            .try_into()
            .expect("length prefix");
        let data_len = u32::from_be_bytes(len_bytes) as usize;
        body = &body[data_start + data_len..];
        blocks += 1;
    }
    blocks
}

async fn handle_car(
    State(state): State<UploadState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadChunkResponse>, StatusCode> {
    let did = headers
        .get(AGENT_DID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?
        .to_string();
    let signature = headers
        .get(AGENT_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| STANDARD.decode(value).ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let stored_blocks = count_framed_blocks(&body);
    state
        .received
        .lock()
        .expect("received lock")
        .push(ReceivedChunk {
            did,
            signature,
            body: body.to_vec(),
        });
    Ok(Json(UploadChunkResponse { stored_blocks }))
}

async fn spawn_upload_server(fail: bool) -> Result<(String, UploadState)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = UploadState::default();
    let app = if fail {
        Router::new().route(
            "/car",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        )
    } else {
        Router::new()
            .route("/car", post(handle_car))
            .with_state(state.clone())
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn chunks_for(bytes: &[u8]) -> Result<ChunkStream> {
    let packager = Sha256Packager::new(8, 32);
    let (blocks, _root) = packager
        .content_address_file(&NamedFile::new("0.png", bytes))?
        .into_parts();
    Ok(packager.chunk(blocks))
}

#[tokio::test]
async fn uploads_every_chunk_with_signed_headers() -> Result<()> {
    let (base_url, state) = spawn_upload_server(false).await?;
    let transport = HttpTransport::new(&format!("{base_url}/"))?;
    let identity = UnverifiedIdentity::generate("artist@example.com").into_verified();

    transport
        .upload(&identity, chunks_for(&[7u8; 100])?)
        .await?;

    let received = state.received.lock().expect("received lock");
    assert!(received.len() > 1);
    for chunk in received.iter() {
        assert_eq!(chunk.did, identity.did().as_str());
        let signature = Signature::from_slice(&chunk.signature).expect("signature bytes");
        identity
            .verifying_key()
            .verify(&chunk.body, &signature)
            .expect("chunk signature verifies");
    }
    Ok(())
}

#[tokio::test]
async fn rejected_chunk_fails_upload() -> Result<()> {
    let (base_url, _state) = spawn_upload_server(true).await?;
    let transport = HttpTransport::new(&base_url)?;
    let identity = UnverifiedIdentity::generate("artist@example.com").into_verified();

    let err = transport
        .upload(&identity, chunks_for(b"payload")?)
        .await
        .expect_err("503 must fail");
    assert!(err.to_string().contains("rejected chunk 0"));
    Ok(())
}

#[tokio::test]
async fn chunk_stream_error_aborts_upload() -> Result<()> {
    let (base_url, state) = spawn_upload_server(false).await?;
    let transport = HttpTransport::new(&base_url)?;
    let identity = UnverifiedIdentity::generate("artist@example.com").into_verified();
    let chunks = stream::iter([Err(anyhow::anyhow!("encoder crashed"))]).boxed();

    assert!(transport.upload(&identity, chunks).await.is_err());
    assert!(state.received.lock().expect("received lock").is_empty());
    Ok(())
}
