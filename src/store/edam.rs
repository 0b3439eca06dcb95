//! EDAM client: user store and note store calls as Thrift-over-HTTP.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::debug;

use thrift::protocol::{TMessageType, TType};

use super::wire::{ThriftReader, ThriftWriter};
use super::{
    NoteDraft, NoteStore, NoteSummary, NoteUpdate, Notebook, StoreConnector, Tag, User,
};
use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("evernote-sync/", env!("CARGO_PKG_VERSION"));
const THRIFT_CONTENT_TYPE: &str = "application/x-thrift";

// ── Transport ──────────────────────────────────────────────────────────────

struct ThriftHttp {
    http: reqwest::Client,
    seq: AtomicI32,
}

impl ThriftHttp {
    fn new() -> Result<Self> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            seq: AtomicI32::new(0),
        })
    }

    /// Send one CALL message and decode the matching REPLY.
    async fn call<T>(
        &self,
        url: &str,
        method: &str,
        args: impl FnOnce(&mut ThriftWriter<'_>),
        result: impl FnOnce(&mut ThriftReader<'_>) -> Result<T>,
    ) -> Result<T> {
        let seq_id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut payload = Vec::new();
        let mut w = ThriftWriter::new(&mut payload);
        w.message_begin(method, TMessageType::Call, seq_id);
        args(&mut w);
        w.field_stop();
        w.finish()?;

        debug!(method, url, "edam call");
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, THRIFT_CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, THRIFT_CONTENT_TYPE)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::RemoteStore(format!("{} returned HTTP {}", method, status)));
        }
        let body = response.bytes().await?;

        let mut r = ThriftReader::new(&body);
        let header = r.message_begin()?;
        if header.message_type == TMessageType::Exception {
            let e = r.application_error()?;
            return Err(Error::RemoteStore(format!("{}: {} ({:?})", method, e.message, e.kind)));
        }
        if header.message_type != TMessageType::Reply || header.name != method {
            return Err(Error::RemoteStore(format!(
                "unexpected reply '{}' ({:?}) to {}",
                header.name, header.message_type, method
            )));
        }
        result(&mut r)
    }
}

/// Decode a `<method>_result` struct: field 0 is the return value, fields 1.. are
/// the declared service exceptions.
fn read_result<T>(
    r: &mut ThriftReader<'_>,
    method: &str,
    success: impl FnOnce(&mut ThriftReader<'_>, TType) -> Result<T>,
) -> Result<T> {
    let mut success = Some(success);
    let mut value = None;
    while let Some((ty, id)) = r.field_begin()? {
        match id {
            0 => match success.take() {
                Some(read) => value = Some(read(r, ty)?),
                None => r.skip(ty)?,
            },
            1..=3 if ty == TType::Struct => {
                let err = read_service_exception(r, id)?;
                return Err(Error::RemoteStore(format!("{}: {}", method, err)));
            }
            _ => r.skip(ty)?,
        }
    }
    value.ok_or_else(|| Error::RemoteStore(format!("{}: reply carried no result", method)))
}

fn read_service_exception(r: &mut ThriftReader<'_>, id: i16) -> Result<String> {
    let mut code = None;
    let mut text = None;
    let mut rate_limit = None;
    while let Some((ty, field)) = r.field_begin()? {
        match (id, field, ty) {
            // EDAMUserException / EDAMSystemException: errorCode
            (1 | 2, 1, TType::I32) => code = Some(r.read_i32()?),
            // parameter / message
            (1 | 2, 2, TType::String) => text = Some(r.read_string()?),
            (2, 3, TType::I32) => rate_limit = Some(r.read_i32()?),
            // EDAMNotFoundException: identifier
            (3, 1, TType::String) => text = Some(r.read_string()?),
            _ => r.skip(ty)?,
        }
    }

    let kind = match id {
        1 => "user exception",
        2 => "system exception",
        _ => "not found",
    };
    let mut message = kind.to_string();
    if let Some(code) = code {
        message.push_str(&format!(" {}", error_code_name(code)));
    }
    if let Some(text) = text {
        message.push_str(&format!(" ({})", text));
    }
    if let Some(seconds) = rate_limit {
        message.push_str(&format!(", retry after {}s", seconds));
    }
    Ok(message)
}

fn error_code_name(code: i32) -> &'static str {
    match code {
        2 => "BAD_DATA_FORMAT",
        3 => "PERMISSION_DENIED",
        4 => "INTERNAL_ERROR",
        5 => "DATA_REQUIRED",
        6 => "LIMIT_REACHED",
        7 => "QUOTA_REACHED",
        8 => "INVALID_AUTH",
        9 => "AUTH_EXPIRED",
        10 => "DATA_CONFLICT",
        11 => "ENML_VALIDATION",
        12 => "SHARD_UNAVAILABLE",
        13 => "LEN_TOO_SHORT",
        14 => "LEN_TOO_LONG",
        15 => "TOO_FEW",
        16 => "TOO_MANY",
        17 => "UNSUPPORTED_OPERATION",
        18 => "TAKEN_DOWN",
        19 => "RATE_LIMIT_REACHED",
        _ => "UNKNOWN",
    }
}

fn expect_type(ty: TType, expected: TType, what: &str) -> Result<()> {
    if ty == expected {
        Ok(())
    } else {
        Err(Error::RemoteStore(format!("unexpected field type {:?} for {}", ty, what)))
    }
}

// ── Struct codecs ──────────────────────────────────────────────────────────

fn read_tag(r: &mut ThriftReader<'_>) -> Result<Tag> {
    let mut tag = Tag {
        guid: String::new(),
        name: String::new(),
    };
    while let Some((ty, id)) = r.field_begin()? {
        match (id, ty) {
            (1, TType::String) => tag.guid = r.read_string()?,
            (2, TType::String) => tag.name = r.read_string()?,
            _ => r.skip(ty)?,
        }
    }
    Ok(tag)
}

fn read_notebook(r: &mut ThriftReader<'_>) -> Result<Notebook> {
    let mut notebook = Notebook {
        guid: String::new(),
        name: String::new(),
        stack: None,
    };
    while let Some((ty, id)) = r.field_begin()? {
        match (id, ty) {
            (1, TType::String) => notebook.guid = r.read_string()?,
            (2, TType::String) => notebook.name = r.read_string()?,
            (12, TType::String) => notebook.stack = Some(r.read_string()?),
            _ => r.skip(ty)?,
        }
    }
    Ok(notebook)
}

fn read_note_guid(r: &mut ThriftReader<'_>) -> Result<String> {
    let mut guid = None;
    while let Some((ty, id)) = r.field_begin()? {
        match (id, ty) {
            (1, TType::String) => guid = Some(r.read_string()?),
            _ => r.skip(ty)?,
        }
    }
    guid.ok_or_else(|| Error::RemoteStore("created note has no guid".to_string()))
}

fn read_note_metadata(r: &mut ThriftReader<'_>) -> Result<NoteSummary> {
    let mut note = NoteSummary {
        guid: String::new(),
        title: String::new(),
        created: 0,
        notebook_guid: None,
        tag_guids: Vec::new(),
    };
    while let Some((ty, id)) = r.field_begin()? {
        match (id, ty) {
            (1, TType::String) => note.guid = r.read_string()?,
            (2, TType::String) => note.title = r.read_string()?,
            (6, TType::I64) => note.created = r.read_i64()?,
            (11, TType::String) => note.notebook_guid = Some(r.read_string()?),
            (12, TType::List) => note.tag_guids = r.read_string_list()?,
            _ => r.skip(ty)?,
        }
    }
    Ok(note)
}

// NotesMetadataList: only the notes list (field 3) is used
fn read_notes_metadata_list(r: &mut ThriftReader<'_>) -> Result<Vec<NoteSummary>> {
    let mut notes = Vec::new();
    while let Some((ty, id)) = r.field_begin()? {
        match (id, ty) {
            (3, TType::List) => notes = r.read_struct_list(read_note_metadata)?,
            _ => r.skip(ty)?,
        }
    }
    Ok(notes)
}

fn read_user(r: &mut ThriftReader<'_>) -> Result<User> {
    let mut user = User {
        id: 0,
        username: None,
    };
    while let Some((ty, id)) = r.field_begin()? {
        match (id, ty) {
            (1, TType::I32) => user.id = r.read_i32()?,
            (2, TType::String) => user.username = Some(r.read_string()?),
            _ => r.skip(ty)?,
        }
    }
    Ok(user)
}

fn write_note(w: &mut ThriftWriter<'_>, draft: &NoteDraft) {
    let attachment = &draft.attachment;
    w.string_field(2, &draft.title);
    w.string_field(3, &draft.body_markup);
    w.string_field(11, &draft.notebook_guid);
    if !draft.tag_guids.is_empty() {
        w.string_list_field(12, &draft.tag_guids);
    }
    w.field_begin(TType::List, 13);
    w.list_begin(TType::Struct, 1);
    // Resource
    w.struct_field(3, |w| {
        w.binary_field(1, &attachment.content_hash);
        w.i32_field(2, attachment.bytes.len() as i32);
        w.binary_field(3, &attachment.bytes);
    });
    w.string_field(4, &attachment.mime_type);
    w.struct_field(11, |w| {
        w.i64_field(2, attachment.created_at.timestamp_millis());
        w.string_field(10, &attachment.original_filename);
        w.bool_field(11, false);
    });
    w.field_stop();
}

fn write_note_update(w: &mut ThriftWriter<'_>, update: &NoteUpdate) {
    w.string_field(1, &update.guid);
    w.string_field(2, &update.title);
    w.string_field(11, &update.notebook_guid);
    w.string_list_field(12, &update.tag_guids);
}

// ── Client ─────────────────────────────────────────────────────────────────

pub struct EdamClient {
    transport: ThriftHttp,
    user_store_url: String,
    note_store_url: String,
    token: String,
}

impl EdamClient {
    /// Resolve the user's note store and return a connected client.
    pub async fn connect(host: &str, token: &str) -> Result<Self> {
        let transport = ThriftHttp::new().map_err(connect_error)?;
        let user_store_url = user_store_url(host);
        let note_store_url = transport
            .call(
                &user_store_url,
                "getNoteStoreUrl",
                |w| w.string_field(1, token),
                |r| {
                    read_result(r, "getNoteStoreUrl", |r, ty| {
                        expect_type(ty, TType::String, "note store url")?;
                        r.read_string()
                    })
                },
            )
            .await
            .map_err(connect_error)?;
        debug!(note_store_url = %note_store_url, "note store resolved");

        Ok(Self {
            transport,
            user_store_url,
            note_store_url,
            token: token.to_string(),
        })
    }

    async fn note_store_call<T>(
        &self,
        method: &str,
        args: impl FnOnce(&mut ThriftWriter<'_>),
        success: impl FnOnce(&mut ThriftReader<'_>, TType) -> Result<T>,
    ) -> Result<T> {
        let token = &self.token;
        self.transport
            .call(
                &self.note_store_url,
                method,
                |w| {
                    w.string_field(1, token);
                    args(w);
                },
                |r| read_result(r, method, success),
            )
            .await
    }
}

/// Fetch the user owning `token` from the user store.
pub async fn fetch_user(host: &str, token: &str) -> Result<User> {
    let transport = ThriftHttp::new()?;
    get_user(&transport, &user_store_url(host), token).await
}

async fn get_user(transport: &ThriftHttp, url: &str, token: &str) -> Result<User> {
    transport
        .call(
            url,
            "getUser",
            |w| w.string_field(1, token),
            |r| {
                read_result(r, "getUser", |r, ty| {
                    expect_type(ty, TType::Struct, "user")?;
                    read_user(r)
                })
            },
        )
        .await
}

fn user_store_url(host: &str) -> String {
    format!("{}/edam/user", host.trim_end_matches('/'))
}

fn connect_error(e: Error) -> Error {
    match e {
        Error::RemoteStore(msg) => Error::RemoteConnect(msg),
        other => other,
    }
}

#[async_trait]
impl NoteStore for EdamClient {
    async fn list_tags(&self) -> Result<Vec<Tag>> {
        self.note_store_call(
            "listTags",
            |_| {},
            |r, ty| {
                expect_type(ty, TType::List, "tag list")?;
                r.read_struct_list(read_tag)
            },
        )
        .await
    }

    async fn create_tag(&self, name: &str) -> Result<Tag> {
        self.note_store_call(
            "createTag",
            |w| w.struct_field(2, |w| w.string_field(2, name)),
            |r, ty| {
                expect_type(ty, TType::Struct, "tag")?;
                read_tag(r)
            },
        )
        .await
    }

    async fn list_notebooks(&self) -> Result<Vec<Notebook>> {
        self.note_store_call(
            "listNotebooks",
            |_| {},
            |r, ty| {
                expect_type(ty, TType::List, "notebook list")?;
                r.read_struct_list(read_notebook)
            },
        )
        .await
    }

    async fn create_notebook(&self, name: &str, stack: Option<&str>) -> Result<Notebook> {
        self.note_store_call(
            "createNotebook",
            |w| {
                w.struct_field(2, |w| {
                    w.string_field(2, name);
                    w.opt_string_field(12, stack);
                })
            },
            |r, ty| {
                expect_type(ty, TType::Struct, "notebook")?;
                read_notebook(r)
            },
        )
        .await
    }

    async fn create_note(&self, draft: &NoteDraft) -> Result<String> {
        self.note_store_call(
            "createNote",
            |w| w.struct_field(2, |w| write_note(w, draft)),
            |r, ty| {
                expect_type(ty, TType::Struct, "note")?;
                read_note_guid(r)
            },
        )
        .await
    }

    async fn search_notes(&self, words: &str, max_results: i32) -> Result<Vec<NoteSummary>> {
        self.note_store_call(
            "findNotesMetadata",
            |w| {
                // NoteFilter
                w.struct_field(2, |w| w.string_field(3, words));
                w.i32_field(3, 0);
                w.i32_field(4, max_results);
                // NotesMetadataResultSpec
                w.struct_field(5, |w| {
                    w.bool_field(2, true);
                    w.bool_field(6, true);
                    w.bool_field(11, true);
                    w.bool_field(12, true);
                });
            },
            |r, ty| {
                expect_type(ty, TType::Struct, "notes metadata list")?;
                read_notes_metadata_list(r)
            },
        )
        .await
    }

    async fn update_note(&self, update: &NoteUpdate) -> Result<()> {
        self.note_store_call(
            "updateNote",
            |w| w.struct_field(2, |w| write_note_update(w, update)),
            |r, ty| {
                expect_type(ty, TType::Struct, "note")?;
                read_note_guid(r).map(|_| ())
            },
        )
        .await
    }

    async fn current_user(&self) -> Result<User> {
        get_user(&self.transport, &self.user_store_url, &self.token).await
    }
}

/// Connects with a fixed host and token.
pub struct EdamConnector {
    host: String,
    token: String,
}

impl EdamConnector {
    pub fn new(host: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl StoreConnector for EdamConnector {
    type Store = EdamClient;

    async fn connect(&self) -> Result<EdamClient> {
        EdamClient::connect(&self.host, &self.token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Attachment;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reply(name: &str, body: impl FnOnce(&mut ThriftWriter<'_>)) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut w = ThriftWriter::new(&mut buf);
        w.message_begin(name, TMessageType::Reply, 1);
        body(&mut w);
        w.field_stop();
        w.finish().unwrap();
        buf
    }

    async fn mount_note_store(server: &MockServer) {
        let url = format!("{}/shard/s1/notestore", server.uri());
        Mock::given(method("POST"))
            .and(path("/edam/user"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(reply(
                "getNoteStoreUrl",
                |w| w.string_field(0, &url),
            )))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_connect_and_list_tags() {
        let server = MockServer::start().await;
        mount_note_store(&server).await;
        let tags = reply("listTags", |w| {
            w.field_begin(TType::List, 0);
            w.list_begin(TType::Struct, 2);
            w.string_field(1, "guid-1");
            w.string_field(2, "paid");
            w.i32_field(4, 17);
            w.field_stop();
            w.string_field(1, "guid-2");
            w.string_field(2, "Tax");
            w.field_stop();
        });
        Mock::given(method("POST"))
            .and(path("/shard/s1/notestore"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tags))
            .mount(&server)
            .await;

        let client = EdamClient::connect(&server.uri(), "S=s1:token").await.unwrap();
        let tags = client.list_tags().await.unwrap();
        assert_eq!(
            tags,
            vec![
                Tag { guid: "guid-1".into(), name: "paid".into() },
                Tag { guid: "guid-2".into(), name: "Tax".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_remote_connect() {
        let server = MockServer::start().await;
        let denied = reply("getNoteStoreUrl", |w| {
            w.struct_field(1, |w| {
                w.i32_field(1, 8);
                w.string_field(2, "authenticationToken");
            });
        });
        Mock::given(method("POST"))
            .and(path("/edam/user"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(denied))
            .mount(&server)
            .await;

        let err = EdamClient::connect(&server.uri(), "bad").await.err().unwrap();
        match err {
            Error::RemoteConnect(msg) => assert!(msg.contains("INVALID_AUTH"), "{}", msg),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_note_rate_limited() {
        let server = MockServer::start().await;
        mount_note_store(&server).await;
        let limited = reply("createNote", |w| {
            w.struct_field(2, |w| {
                w.i32_field(1, 19);
                w.i32_field(3, 900);
            });
        });
        Mock::given(method("POST"))
            .and(path("/shard/s1/notestore"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(limited))
            .mount(&server)
            .await;

        let client = EdamClient::connect(&server.uri(), "S=s1:token").await.unwrap();
        let draft = NoteDraft {
            title: "a.pdf".into(),
            notebook_guid: "nb".into(),
            tag_guids: vec![],
            body_markup: "<en-note/>".into(),
            attachment: Attachment {
                bytes: b"%PDF".to_vec(),
                content_hash: md5::compute(b"%PDF").0,
                mime_type: "application/pdf".into(),
                original_filename: "a.pdf".into(),
                created_at: Utc::now(),
            },
        };
        let err = client.create_note(&draft).await.unwrap_err();
        match err {
            Error::RemoteStore(msg) => {
                assert!(msg.contains("RATE_LIMIT_REACHED"), "{}", msg);
                assert!(msg.contains("retry after 900s"), "{}", msg);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_user() {
        let server = MockServer::start().await;
        let user = reply("getUser", |w| {
            w.struct_field(0, |w| {
                w.i32_field(1, 42);
                w.string_field(2, "scanner");
                w.string_field(4, "Scanner Inbox");
            });
        });
        Mock::given(method("POST"))
            .and(path("/edam/user"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(user))
            .expect(1)
            .mount(&server)
            .await;

        let user = fetch_user(&server.uri(), "S=s1:token").await.unwrap();
        assert_eq!(user.id, 42);
        assert_eq!(user.username.as_deref(), Some("scanner"));
    }

    #[test]
    fn test_write_note_carries_hash_and_filename() {
        let bytes = b"hello".to_vec();
        let draft = NoteDraft {
            title: "hello.txt".into(),
            notebook_guid: "nb-guid".into(),
            tag_guids: vec!["t1".into()],
            body_markup: "<en-note/>".into(),
            attachment: Attachment {
                content_hash: md5::compute(&bytes).0,
                bytes,
                mime_type: "text/plain".into(),
                original_filename: "hello.txt".into(),
                created_at: Utc::now(),
            },
        };
        let mut encoded = Vec::new();
        let mut w = ThriftWriter::new(&mut encoded);
        write_note(&mut w, &draft);
        w.field_stop();
        w.finish().unwrap();

        let hash = md5::compute(b"hello").0;
        assert!(encoded.windows(16).any(|win| win == hash));
        assert!(encoded.windows(9).any(|win| win == b"hello.txt"));
        assert!(encoded.windows(7).any(|win| win == b"nb-guid"));
    }

    #[test]
    fn test_read_notes_metadata_list() {
        let mut bytes = Vec::new();
        let mut w = ThriftWriter::new(&mut bytes);
        w.i32_field(1, 0);
        w.i32_field(2, 1);
        w.field_begin(TType::List, 3);
        w.list_begin(TType::Struct, 1);
        w.string_field(1, "note-1");
        w.string_field(2, "Scan 42");
        w.i64_field(6, 1_600_000_000_000);
        w.string_list_field(12, &["t".to_string()]);
        w.field_stop();
        w.field_stop();
        w.finish().unwrap();

        let notes = read_notes_metadata_list(&mut ThriftReader::new(&bytes)).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].guid, "note-1");
        assert_eq!(notes[0].created, 1_600_000_000_000);
        assert_eq!(notes[0].tag_guids, vec!["t".to_string()]);
    }
}
