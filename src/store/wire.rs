//! Message and field helpers for EDAM calls over the `thrift` crate's strict
//! binary protocol.

use thrift::protocol::{
    TBinaryInputProtocol, TBinaryOutputProtocol, TFieldIdentifier, TInputProtocol,
    TListIdentifier, TMessageIdentifier, TMessageType, TOutputProtocol, TStructIdentifier, TType,
};
use thrift::ApplicationError;

use crate::error::{Error, Result};

/// Writes into a caller-owned buffer. Protocol errors are kept and reported
/// once by [`ThriftWriter::finish`], so field helpers chain without `?`.
pub struct ThriftWriter<'a> {
    protocol: TBinaryOutputProtocol<&'a mut Vec<u8>>,
    error: Option<thrift::Error>,
}

impl<'a> ThriftWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self {
            protocol: TBinaryOutputProtocol::new(buf, true),
            error: None,
        }
    }

    fn record(&mut self, result: thrift::Result<()>) {
        if let Err(e) = result {
            if self.error.is_none() {
                self.error = Some(e);
            }
        }
    }

    pub fn message_begin(&mut self, name: &str, kind: TMessageType, seq_id: i32) {
        let header = TMessageIdentifier {
            name: name.to_string(),
            message_type: kind,
            sequence_number: seq_id,
        };
        let result = self.protocol.write_message_begin(&header);
        self.record(result);
    }

    pub fn field_begin(&mut self, field_type: TType, id: i16) {
        let field = TFieldIdentifier {
            name: None,
            field_type,
            id: Some(id),
        };
        let result = self.protocol.write_field_begin(&field);
        self.record(result);
    }

    pub fn field_stop(&mut self) {
        let result = self.protocol.write_field_stop();
        self.record(result);
    }

    pub fn list_begin(&mut self, element_type: TType, len: usize) {
        let list = TListIdentifier {
            element_type,
            size: len as i32,
        };
        let result = self.protocol.write_list_begin(&list);
        self.record(result);
    }

    pub fn string_field(&mut self, id: i16, v: &str) {
        self.field_begin(TType::String, id);
        let result = self.protocol.write_string(v);
        self.record(result);
    }

    pub fn opt_string_field(&mut self, id: i16, v: Option<&str>) {
        if let Some(v) = v {
            self.string_field(id, v);
        }
    }

    pub fn binary_field(&mut self, id: i16, v: &[u8]) {
        self.field_begin(TType::String, id);
        let result = self.protocol.write_bytes(v);
        self.record(result);
    }

    pub fn bool_field(&mut self, id: i16, v: bool) {
        self.field_begin(TType::Bool, id);
        let result = self.protocol.write_bool(v);
        self.record(result);
    }

    pub fn i32_field(&mut self, id: i16, v: i32) {
        self.field_begin(TType::I32, id);
        let result = self.protocol.write_i32(v);
        self.record(result);
    }

    pub fn i64_field(&mut self, id: i16, v: i64) {
        self.field_begin(TType::I64, id);
        let result = self.protocol.write_i64(v);
        self.record(result);
    }

    pub fn string_list_field(&mut self, id: i16, values: &[String]) {
        self.field_begin(TType::List, id);
        self.list_begin(TType::String, values.len());
        for v in values {
            let result = self.protocol.write_string(v);
            self.record(result);
        }
    }

    /// Nested struct field; `body` writes the inner fields, the stop byte is added here.
    pub fn struct_field(&mut self, id: i16, body: impl FnOnce(&mut Self)) {
        self.field_begin(TType::Struct, id);
        let result = self.protocol.write_struct_begin(&TStructIdentifier {
            name: String::new(),
        });
        self.record(result);
        body(self);
        self.field_stop();
        let result = self.protocol.write_struct_end();
        self.record(result);
    }

    /// Flush and report the first protocol error, if any.
    pub fn finish(mut self) -> Result<()> {
        let result = self.protocol.flush();
        self.record(result);
        match self.error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

pub struct ThriftReader<'a> {
    protocol: TBinaryInputProtocol<&'a [u8]>,
}

impl<'a> ThriftReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            protocol: TBinaryInputProtocol::new(buf, true),
        }
    }

    pub fn message_begin(&mut self) -> Result<TMessageIdentifier> {
        Ok(self.protocol.read_message_begin()?)
    }

    /// Next field header, `None` at the stop byte.
    pub fn field_begin(&mut self) -> Result<Option<(TType, i16)>> {
        let field = self.protocol.read_field_begin()?;
        if field.field_type == TType::Stop {
            return Ok(None);
        }
        Ok(Some((field.field_type, field.id.unwrap_or_default())))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.protocol.read_bool()?)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.protocol.read_i32()?)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.protocol.read_i64()?)
    }

    pub fn read_string(&mut self) -> Result<String> {
        Ok(self.protocol.read_string()?)
    }

    fn list_begin(&mut self, expected: TType, what: &str) -> Result<usize> {
        let list = self.protocol.read_list_begin()?;
        if list.element_type != expected {
            return Err(Error::RemoteStore(format!(
                "thrift protocol: expected {}, got list<{:?}>",
                what, list.element_type
            )));
        }
        usize::try_from(list.size)
            .map_err(|_| Error::RemoteStore("thrift protocol: negative list size".to_string()))
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>> {
        let len = self.list_begin(TType::String, "list<string>")?;
        let values = (0..len).map(|_| self.read_string()).collect::<Result<Vec<_>>>()?;
        self.protocol.read_list_end()?;
        Ok(values)
    }

    /// Read a list of structs using `item` for each element.
    pub fn read_struct_list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let len = self.list_begin(TType::Struct, "list<struct>")?;
        let values = (0..len).map(|_| item(self)).collect::<Result<Vec<_>>>()?;
        self.protocol.read_list_end()?;
        Ok(values)
    }

    pub fn skip(&mut self, field_type: TType) -> Result<()> {
        Ok(self.protocol.skip(field_type)?)
    }

    /// Body of an EXCEPTION message.
    pub fn application_error(&mut self) -> Result<ApplicationError> {
        Ok(thrift::Error::read_application_error_from_in_protocol(
            &mut self.protocol,
        )?)
    }
}
