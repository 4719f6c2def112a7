//! Multipart accessor returned by `ctx.bind_body("file")`.

use std::sync::Arc;

use mlua::{MetaMethod, UserData, UserDataFields, UserDataMethods};

use crate::context::FormFile;

/// The file parts of a request body.
#[derive(Debug, Clone)]
pub struct LuaFormFiles(Arc<[FormFile]>);

impl LuaFormFiles {
    pub fn new(files: &[FormFile]) -> Self {
        Self(Arc::from(files))
    }
}

impl UserData for LuaFormFiles {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("get", |_, this, name: String| {
            let file = this.0.iter().find(|f| f.field == name).cloned();
            Ok(file.map(LuaFormFile))
        });

        methods.add_method("names", |_, this, ()| {
            Ok(this.0.iter().map(|f| f.field.clone()).collect::<Vec<_>>())
        });

        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.0.len()));
    }
}

/// One uploaded file.
#[derive(Debug, Clone)]
pub struct LuaFormFile(FormFile);

impl UserData for LuaFormFile {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("name", |_, this| Ok(this.0.field.clone()));
        fields.add_field_method_get("filename", |_, this| Ok(this.0.filename.clone()));
        fields.add_field_method_get("content_type", |_, this| Ok(this.0.content_type.clone()));
        fields.add_field_method_get("size", |_, this| Ok(this.0.data.len()));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("body", |lua, this, ()| lua.create_string(&this.0.data[..]));

        // Returns the number of bytes written.
        methods.add_method("save", |_, this, path: String| {
            std::fs::write(&path, &this.0.data).map_err(mlua::Error::external)?;
            tracing::debug!(path = %path, size = this.0.data.len(), "Saved uploaded file");
            Ok(this.0.data.len())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mlua::Lua;

    #[test]
    fn test_form_files_accessor() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("saved.txt");

        let lua = Lua::new();
        let files = LuaFormFiles::new(&[FormFile {
            field: "upload".into(),
            filename: Some("notes.txt".into()),
            content_type: Some("text/plain".into()),
            data: Bytes::from_static(b"hello"),
        }]);
        lua.globals().set("files", files).unwrap();
        lua.globals().set("target", target.to_string_lossy().to_string()).unwrap();

        lua.load(
            r#"
            assert(#files == 1)
            assert(files:names()[1] == "upload")
            assert(files:get("missing") == nil)

            local f = files:get("upload")
            assert(f.name == "upload")
            assert(f.filename == "notes.txt")
            assert(f.content_type == "text/plain")
            assert(f.size == 5)
            assert(f:body() == "hello")
            assert(f:save(target) == 5)
            "#,
        )
        .exec()
        .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
    }
}
