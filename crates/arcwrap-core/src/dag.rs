//! Site directory assembly.
//!
//! [`DagBuilder`] loads the template directory node, links every uploaded
//! archive into it, generates the `archives` manifest, uploads that through
//! the regular file path and links it under the reserved manifest name.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::Backend;
use crate::codec::{IdentifierUrl, DAG_PB};
use crate::config::WrapperConfig;
use crate::error::{Result, WrapError};
use crate::input::InputFile;
use crate::node::DirectoryNode;
use crate::upload::{UploadOrchestrator, UploadResult};

/// One archive entry of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

impl ArchiveDescriptor {
    fn from_upload(upload: &UploadResult) -> Self {
        Self {
            name: upload.source.display_name(),
            url: upload.url.to_string(),
            description: upload.source.description.clone().unwrap_or_default(),
        }
    }
}

/// The generated `{"archives": [...]}` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub archives: Vec<ArchiveDescriptor>,
}

impl Manifest {
    /// Tab-indented JSON, fields in declaration order.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut ser)?;
        Ok(out)
    }
}

/// Result of linking a batch into the template.
#[derive(Debug, Clone)]
pub struct WrappedSite {
    pub node: DirectoryNode,
    pub manifest: Manifest,
    pub manifest_bytes: Vec<u8>,
    pub manifest_upload: UploadResult,
}

/// Builds the site directory from a template and a set of uploads.
pub struct DagBuilder {
    backend: Arc<dyn Backend>,
    uploader: UploadOrchestrator,
    config: WrapperConfig,
}

impl DagBuilder {
    pub fn new(backend: Arc<dyn Backend>, uploader: UploadOrchestrator, config: WrapperConfig) -> Self {
        Self {
            backend,
            uploader,
            config,
        }
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    /// Fetch and decode the configured template.
    pub async fn load_template(&self) -> Result<DirectoryNode> {
        self.load_template_from(&self.config.template_url).await
    }

    /// Fetch the raw block behind `template_url` and decode it.
    ///
    /// When the URL names a dag-pb root block directly, the fetched bytes are
    /// checked against it and a mismatch is reported as a corrupt node. A
    /// URL with a path resolves to some other block, which is only decoded.
    pub async fn load_template_from(&self, template_url: &str) -> Result<DirectoryNode> {
        let url = IdentifierUrl::parse(template_url)?;
        let bytes = self
            .backend
            .fetch_raw(&url.with_raw_format())
            .await
            .map_err(|source| WrapError::TemplateUnavailable {
                url: template_url.to_string(),
                source,
            })?;
        if url.is_root() && url.cid().codec() == DAG_PB && !url.cid().verify(&bytes) {
            return Err(WrapError::CorruptNode(format!(
                "template bytes do not hash to {}",
                url.cid()
            )));
        }
        let node = DirectoryNode::decode(&bytes)?;
        info!(
            event = "template.loaded",
            template = %url.cid(),
            links = node.len(),
        );
        Ok(node)
    }

    /// Upsert one link per completed upload, in order, and build the manifest
    /// entries for them.
    pub fn link_files(&self, node: &mut DirectoryNode, completed: &[UploadResult]) -> Manifest {
        let mut manifest = Manifest::default();
        for upload in completed {
            node.upsert_link(&upload.source.name, upload.content_id(), upload.size);
            manifest.archives.push(ArchiveDescriptor::from_upload(upload));
        }
        debug!(files = completed.len(), "linked uploads into site");
        manifest
    }

    /// Serialize and upload `manifest`, then link it under the reserved name.
    ///
    /// Runs after the file links, so a file that used the reserved name is
    /// overwritten by the manifest.
    pub async fn attach_manifest(
        &self,
        node: &mut DirectoryNode,
        manifest: &Manifest,
    ) -> Result<(Vec<u8>, UploadResult)> {
        let bytes = manifest.to_json_bytes()?;
        let file = InputFile::new(self.config.manifest_name.clone(), bytes.clone())
            .with_media_type("application/json");
        let upload = self.uploader.upload_file(file).await?;
        node.upsert_link(&self.config.manifest_name, upload.content_id(), upload.size);
        info!(
            event = "manifest.linked",
            name = %self.config.manifest_name,
            archives = manifest.archives.len(),
            cid = %upload.content_id(),
        );
        Ok((bytes, upload))
    }

    /// Link `completed` into `template` and attach the manifest.
    pub async fn wrap(
        &self,
        mut template: DirectoryNode,
        completed: &[UploadResult],
    ) -> Result<WrappedSite> {
        let manifest = self.link_files(&mut template, completed);
        let (manifest_bytes, manifest_upload) =
            self.attach_manifest(&mut template, &manifest).await?;
        Ok(WrappedSite {
            node: template,
            manifest,
            manifest_bytes,
            manifest_upload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, StorageError, StorageResult};
    use crate::codec::ContentId;
    use crate::config::SizePolicy;
    use crate::progress::NoopSink;

    fn builder(backend: &Arc<MemoryBackend>, template_url: &str) -> DagBuilder {
        let uploader =
            UploadOrchestrator::new(backend.clone(), Arc::new(NoopSink), SizePolicy::Local);
        let config = WrapperConfig {
            template_url: template_url.to_string(),
            ..WrapperConfig::default()
        };
        DagBuilder::new(backend.clone(), uploader, config)
    }

    fn seeded() -> (Arc<MemoryBackend>, String, DirectoryNode) {
        let backend = Arc::new(MemoryBackend::new());
        let mut template = DirectoryNode::empty_unixfs_dir();
        template.upsert_link("index.html", ContentId::hash_raw(b"<html>"), 6);
        let url = backend.insert_node_block(&template.encode());
        (backend, url, template)
    }

    async fn upload(backend: &Arc<MemoryBackend>, file: InputFile) -> UploadResult {
        UploadOrchestrator::new(backend.clone(), Arc::new(NoopSink), SizePolicy::Local)
            .upload_file(file)
            .await
            .unwrap()
    }

    #[test]
    fn manifest_json_is_tab_indented_with_stable_keys() {
        let manifest = Manifest {
            archives: vec![ArchiveDescriptor {
                name: "Site".to_string(),
                url: "ipfs://bafy".to_string(),
                description: String::new(),
            }],
        };
        let text = String::from_utf8(manifest.to_json_bytes().unwrap()).unwrap();
        assert_eq!(
            text,
            "{\n\t\"archives\": [\n\t\t{\n\t\t\t\"name\": \"Site\",\n\t\t\t\"url\": \"ipfs://bafy\",\n\t\t\t\"description\": \"\"\n\t\t}\n\t]\n}"
        );
    }

    #[test]
    fn manifest_description_defaults_when_absent() {
        let parsed: Manifest =
            serde_json::from_str(r#"{"archives":[{"name":"a","url":"ipfs://x"}]}"#).unwrap();
        assert_eq!(parsed.archives[0].description, "");
    }

    #[tokio::test]
    async fn load_template_decodes_fetched_block() {
        let (backend, url, template) = seeded();
        let loaded = builder(&backend, &url).load_template().await.unwrap();
        assert_eq!(loaded, template);
    }

    #[tokio::test]
    async fn load_template_fetch_failure_is_unavailable() {
        let (backend, url, _) = seeded();
        backend.fail_fetch();
        let err = builder(&backend, &url).load_template().await.unwrap_err();
        assert!(matches!(err, WrapError::TemplateUnavailable { .. }));
    }

    #[tokio::test]
    async fn load_template_missing_block_is_unavailable() {
        let backend = Arc::new(MemoryBackend::new());
        let url = format!("{}/", ContentId::hash(b"absent").to_url());
        let err = builder(&backend, &url).load_template().await.unwrap_err();
        assert!(matches!(err, WrapError::TemplateUnavailable { .. }));
    }

    #[tokio::test]
    async fn load_template_garbage_is_corrupt() {
        let backend = Arc::new(MemoryBackend::new());
        let url = backend.insert_node_block(&[0xff, 0xff, 0xff]);
        let err = builder(&backend, &url).load_template().await.unwrap_err();
        assert!(matches!(err, WrapError::CorruptNode(_)));
    }

    #[tokio::test]
    async fn template_with_path_is_not_checked_against_root() {
        let mut site = DirectoryNode::empty_unixfs_dir();
        site.upsert_link("index.html", ContentId::hash_raw(b"<html>"), 6);
        let site_bytes = site.encode();
        let mut root = DirectoryNode::empty_unixfs_dir();
        root.upsert_link("site", ContentId::hash(&site_bytes), site_bytes.len() as u64);

        let backend = Arc::new(PathResolvingBackend {
            root: ContentId::hash(&root.encode()),
            site: site_bytes,
        });
        let url = format!("{}/site/", backend.root.to_url());
        let uploader =
            UploadOrchestrator::new(backend.clone(), Arc::new(NoopSink), SizePolicy::Local);
        let config = WrapperConfig {
            template_url: url,
            ..WrapperConfig::default()
        };
        let loaded = DagBuilder::new(backend, uploader, config)
            .load_template()
            .await
            .unwrap();
        assert_eq!(loaded, site);
    }

    /// Serves the `site` sub-directory for any `/site/` path under `root`.
    struct PathResolvingBackend {
        root: ContentId,
        site: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl Backend for PathResolvingBackend {
        async fn store(&self, _name: &str, _data: &[u8]) -> StorageResult<String> {
            Err(StorageError::Rejected("read-only".to_string()))
        }

        async fn size_of(&self, url: &str) -> StorageResult<u64> {
            Err(StorageError::NotFound { url: url.to_string() })
        }

        async fn fetch_raw(&self, url: &str) -> StorageResult<Vec<u8>> {
            let parsed = IdentifierUrl::parse(url)
                .map_err(|e| StorageError::InvalidIdentifier(e.to_string()))?;
            if parsed.cid() == self.root && parsed.suffix().starts_with("/site/") {
                Ok(self.site.clone())
            } else {
                Err(StorageError::NotFound { url: url.to_string() })
            }
        }

        async fn publish_container(&self, _car: &[u8]) -> StorageResult<Vec<String>> {
            Err(StorageError::Rejected("read-only".to_string()))
        }
    }

    #[tokio::test]
    async fn wrap_links_files_and_manifest() {
        let (backend, url, _) = seeded();
        let a = upload(
            &backend,
            InputFile::new("a.wacz", b"aaa".to_vec()).with_description("first"),
        )
        .await;
        let b = upload(
            &backend,
            InputFile::new("b.wacz", b"bbbb".to_vec()).with_display_name("Bee"),
        )
        .await;

        let dag = builder(&backend, &url);
        let template = dag.load_template().await.unwrap();
        let site = dag.wrap(template, &[a.clone(), b.clone()]).await.unwrap();

        let names: Vec<_> = site.node.links().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["index.html", "a.wacz", "b.wacz", "archives.json"]);
        assert_eq!(site.node.link("a.wacz").unwrap().target, a.content_id());
        assert_eq!(site.node.link("b.wacz").unwrap().size, 4);

        assert_eq!(site.manifest.archives[0].name, "a");
        assert_eq!(site.manifest.archives[0].description, "first");
        assert_eq!(site.manifest.archives[1].name, "Bee");
        assert_eq!(site.manifest.archives[1].url, b.url.to_string());

        let manifest_link = site.node.link("archives.json").unwrap();
        assert_eq!(manifest_link.target, ContentId::hash_raw(&site.manifest_bytes));
        assert_eq!(manifest_link.size, site.manifest_bytes.len() as u64);
        assert_eq!(backend.get(&manifest_link.target).unwrap(), site.manifest_bytes);
    }

    #[tokio::test]
    async fn manifest_wins_name_collision() {
        let (backend, url, _) = seeded();
        let impostor = upload(&backend, InputFile::new("archives.json", b"{}".to_vec())).await;

        let dag = builder(&backend, &url);
        let template = dag.load_template().await.unwrap();
        let site = dag.wrap(template, &[impostor.clone()]).await.unwrap();

        let link = site.node.link("archives.json").unwrap();
        assert_eq!(link.target, site.manifest_upload.content_id());
        assert_ne!(link.target, impostor.content_id());
        assert_eq!(
            site.node.links().iter().filter(|l| l.name == "archives.json").count(),
            1
        );
    }

    #[tokio::test]
    async fn existing_template_link_is_replaced_in_place() {
        let (backend, url, _) = seeded();
        let page = upload(&backend, InputFile::new("index.html", b"<new>".to_vec())).await;
        let dag = builder(&backend, &url);
        let template = dag.load_template().await.unwrap();
        let site = dag.wrap(template, &[page.clone()]).await.unwrap();
        assert_eq!(site.node.links()[0].name, "index.html");
        assert_eq!(site.node.links()[0].target, page.content_id());
    }

    #[tokio::test]
    async fn manifest_upload_failure_propagates() {
        let (backend, url, _) = seeded();
        backend.fail_store_for("archives.json");
        let dag = builder(&backend, &url);
        let template = dag.load_template().await.unwrap();
        let err = dag.wrap(template, &[]).await.unwrap_err();
        assert!(matches!(err, WrapError::UploadFailed { .. }));
    }
}
