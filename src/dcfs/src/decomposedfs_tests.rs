#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use blob_store::{BlobStore, LocalBlobStore};
    use dcfs_lib::{
        DcfsError, Event, EventStream, InProcEventStream, LockInfo, OwnerGrantsPermissions,
        PermissionSet, PostprocessingOutcome, Reference, RequestContext, ResourceId, User,
        UserId, SPACE_TYPE_PERSONAL,
    };
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    use crate::config::{DcfsConfig, MetadataBackendKind};
    use crate::decomposedfs::{Decomposedfs, UploadOptions};
    use crate::node::Node;
    use crate::spaces::{SpaceFilter, SpacePatch, StorageSpace};
    use crate::upload::UploadSession;

    struct TestEnv {
        _tmp: TempDir,
        fs: Arc<Decomposedfs>,
        stream: Arc<InProcEventStream>,
        blobstore: Arc<LocalBlobStore>,
        space: StorageSpace,
        ctx: RequestContext,
    }

    fn alice() -> User {
        User::new("idp", "alice-id", "alice")
    }

    fn bob() -> User {
        User::new("idp", "bob-id", "bob")
    }

    async fn create_test_env() -> TestEnv {
        create_test_env_with(|_| {}).await
    }

    async fn create_test_env_with(tune: impl FnOnce(&mut DcfsConfig)) -> TestEnv {
        let tmp = TempDir::new().unwrap();
        let mut config = DcfsConfig::new(tmp.path().join("storage"));
        config.metadata_backend = MetadataBackendKind::Sidecar;
        config.stat_cache_ttl_secs = 0;
        config.max_acquire_lock_cycles = 50;
        config.lock_cycle_duration_factor_ms = 2;
        tune(&mut config);

        let blobstore = Arc::new(
            LocalBlobStore::new(tmp.path().join("blobstore"))
                .await
                .unwrap(),
        );
        let stream = Arc::new(InProcEventStream::default());
        let fs = Decomposedfs::new(
            config,
            blobstore.clone(),
            Arc::new(OwnerGrantsPermissions),
            stream.clone(),
        )
        .await
        .unwrap();

        let ctx = RequestContext::new(alice());
        let space = fs
            .create_space(&ctx, SPACE_TYPE_PERSONAL, "alice's space", None)
            .await
            .unwrap();

        TestEnv {
            _tmp: tmp,
            fs,
            stream,
            blobstore,
            space,
            ctx,
        }
    }

    impl TestEnv {
        fn space_ref(&self, path: &str) -> Reference {
            Reference::space_path(&self.space.id, path)
        }

        async fn grant(&self, user: &UserId, perms: PermissionSet) {
            let root = Node::read(self.fs.lookup(), &self.space.id, &self.space.id)
                .await
                .unwrap();
            root.set_grant(self.fs.lookup(), user, &perms).unwrap();
        }

        async fn upload(&self, path: &str, content: &[u8]) -> ResourceId {
            let upload_id = self
                .fs
                .initiate_upload(
                    &self.ctx,
                    &self.space_ref(path),
                    content.len() as u64,
                    UploadOptions::default(),
                )
                .await
                .unwrap();
            if !content.is_empty() {
                self.fs
                    .upload_chunk(&self.ctx, &upload_id, 0, content)
                    .await
                    .unwrap();
            }
            let info = self
                .fs
                .finalize_upload(&self.ctx, &upload_id)
                .await
                .unwrap()
                .expect("sync finalize returns the resource");
            info.id
        }

        async fn etag_of(&self, path: &str) -> String {
            self.fs
                .get_md(&self.ctx, &self.space_ref(path))
                .await
                .unwrap()
                .etag
        }
    }

    async fn wait_for_upload_ready(
        rx: &mut tokio::sync::broadcast::Receiver<Event>,
    ) -> Option<(String, bool)> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(Event::UploadReady {
                    upload_id, failed, ..
                })) => return Some((upload_id, failed)),
                Ok(Ok(_)) => continue,
                _ => return None,
            }
        }
    }

    // ---- end to end scenarios ------------------------------------------

    #[tokio::test]
    async fn create_upload_finalize_roundtrip() {
        let env = create_test_env().await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/a"))
            .await
            .unwrap();
        let dir_etag = env.etag_of("/a").await;

        let upload_id = env
            .fs
            .initiate_upload(&env.ctx, &env.space_ref("/a/hello.txt"), 5, UploadOptions::default())
            .await
            .unwrap();
        let offset = env
            .fs
            .upload_chunk(&env.ctx, &upload_id, 0, b"hello")
            .await
            .unwrap();
        assert_eq!(offset, 5);
        let info = env
            .fs
            .finalize_upload(&env.ctx, &upload_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.size, 5);

        let md = env
            .fs
            .get_md(&env.ctx, &env.space_ref("/a/hello.txt"))
            .await
            .unwrap();
        assert_eq!(md.size, 5);
        assert_eq!(md.name, "hello.txt");
        assert!(!md.processing);
        assert_eq!(md.checksums.get("sha256").map(|s| s.len()), Some(64));

        // the parent picked up the subtree change
        assert_ne!(env.etag_of("/a").await, dir_etag);

        let mut reader = env
            .fs
            .download(&env.ctx, &env.space_ref("/a/hello.txt"))
            .await
            .unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn move_onto_existing_name_is_rejected_atomically() {
        let env = create_test_env().await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/x"))
            .await
            .unwrap();
        env.upload("/x/f", b"f-content").await;
        env.upload("/x/g", b"g-content").await;
        let parent_etag = env.etag_of("/x").await;

        let err = env
            .fs
            .move_node(&env.ctx, &env.space_ref("/x/f"), &env.space_ref("/x/g"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists(), "got {:?}", err);

        // source intact, parent unchanged
        let f = env
            .fs
            .get_md(&env.ctx, &env.space_ref("/x/f"))
            .await
            .unwrap();
        assert_eq!(f.size, 9);
        assert_eq!(env.etag_of("/x").await, parent_etag);
    }

    #[tokio::test]
    async fn lock_guards_mutations_until_holder_presents_token() {
        let env = create_test_env().await;
        env.upload("/doc", b"content").await;
        env.grant(&bob().id, PermissionSet::all()).await;

        let lock = LockInfo::new("L1", alice().id);
        env.fs
            .set_lock(&env.ctx, &env.space_ref("/doc"), &lock)
            .await
            .unwrap();

        // a caller without the token is fenced, holder id disclosed
        let bob_ctx = RequestContext::new(bob());
        let err = env
            .fs
            .delete(&bob_ctx, &env.space_ref("/doc"))
            .await
            .unwrap_err();
        match err {
            DcfsError::Locked(id) => assert_eq!(id, "L1"),
            other => panic!("expected Locked, got {:?}", other),
        }

        // the holder presenting the token passes
        let ctx = RequestContext::new(alice()).with_lock_id("L1");
        env.fs.delete(&ctx, &env.space_ref("/doc")).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_touches_propagate_without_surfacing_contention() {
        let env = create_test_env().await;
        for p in ["/a", "/a/b", "/a/b/c"] {
            env.fs.create_dir(&env.ctx, &env.space_ref(p)).await.unwrap();
        }
        let tmtime_before = env
            .fs
            .get_md(&env.ctx, &env.space_ref("/a"))
            .await
            .unwrap()
            .mtime;

        let mut handles = Vec::new();
        for i in 0..8 {
            let fs = env.fs.clone();
            let ctx = env.ctx.clone();
            let reference = env.space_ref(&format!("/a/b/c/f{}", i));
            handles.push(tokio::spawn(async move {
                fs.touch_file(&ctx, &reference).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let a = env.fs.get_md(&env.ctx, &env.space_ref("/a")).await.unwrap();
        assert_eq!(a.size, 0, "zero-length touches must not grow the tree");
        assert!(a.mtime >= tmtime_before);
        let listed = env
            .fs
            .list_folder(&env.ctx, &env.space_ref("/a/b/c"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 8);
    }

    #[tokio::test]
    async fn concurrent_uploads_account_sizes_exactly() {
        let env = create_test_env().await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/data"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..6 {
            let fs = env.fs.clone();
            let ctx = env.ctx.clone();
            let reference = env.space_ref(&format!("/data/f{}", i));
            handles.push(tokio::spawn(async move {
                let upload_id = fs
                    .initiate_upload(&ctx, &reference, 4, UploadOptions::default())
                    .await?;
                fs.upload_chunk(&ctx, &upload_id, 0, b"abcd").await?;
                fs.finalize_upload(&ctx, &upload_id).await?;
                Ok::<_, DcfsError>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let (_, in_use, _) = env
            .fs
            .get_quota(&env.ctx, &Reference::id(ResourceId::space_root(&env.space.id)))
            .await
            .unwrap();
        assert_eq!(in_use, 24);
    }

    #[tokio::test]
    async fn postprocessing_delete_discards_placeholder_and_notifies_once() {
        let env = create_test_env_with(|c| c.async_file_uploads = true).await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/a"))
            .await
            .unwrap();
        let parent_etag = env.etag_of("/a").await;
        let mut rx = env.stream.subscribe();

        let upload_id = env
            .fs
            .initiate_upload(&env.ctx, &env.space_ref("/a/f"), 3, UploadOptions::default())
            .await
            .unwrap();
        env.fs
            .upload_chunk(&env.ctx, &upload_id, 0, b"xyz")
            .await
            .unwrap();
        let parked = env
            .fs
            .finalize_upload(&env.ctx, &upload_id)
            .await
            .unwrap();
        assert!(parked.is_none(), "async finalize must await post-processing");

        env.stream
            .publish(Event::PostprocessingFinished {
                upload_id: upload_id.clone(),
                outcome: PostprocessingOutcome::Delete,
                executing_user: alice().id,
            })
            .await
            .unwrap();

        let (ready_id, failed) = wait_for_upload_ready(&mut rx).await.expect("UploadReady");
        assert_eq!(ready_id, upload_id);
        assert!(failed);

        // the placeholder is gone and the parent etag refreshed
        let err = env
            .fs
            .get_md(&env.ctx, &env.space_ref("/a/f"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_ne!(env.etag_of("/a").await, parent_etag);

        // exactly once
        assert!(
            tokio::time::timeout(Duration::from_millis(300), async {
                wait_for_upload_ready(&mut rx).await
            })
            .await
            .unwrap_or(None)
            .is_none()
        );
    }

    #[tokio::test]
    async fn postprocessing_continue_promotes_the_upload() {
        let env = create_test_env_with(|c| c.async_file_uploads = true).await;
        let mut rx = env.stream.subscribe();

        let upload_id = env
            .fs
            .initiate_upload(&env.ctx, &env.space_ref("/f"), 3, UploadOptions::default())
            .await
            .unwrap();
        env.fs
            .upload_chunk(&env.ctx, &upload_id, 0, b"xyz")
            .await
            .unwrap();
        env.fs.finalize_upload(&env.ctx, &upload_id).await.unwrap();

        // while processing, the placeholder is visible but flagged
        let md = env.fs.get_md(&env.ctx, &env.space_ref("/f")).await.unwrap();
        assert!(md.processing);

        env.stream
            .publish(Event::PostprocessingFinished {
                upload_id: upload_id.clone(),
                outcome: PostprocessingOutcome::Continue,
                executing_user: alice().id,
            })
            .await
            .unwrap();
        let (_, failed) = wait_for_upload_ready(&mut rx).await.expect("UploadReady");
        assert!(!failed);

        let md = env.fs.get_md(&env.ctx, &env.space_ref("/f")).await.unwrap();
        assert_eq!(md.size, 3);
        assert!(!md.processing);
    }

    #[tokio::test]
    async fn quota_is_enforced_on_upload() {
        let env = create_test_env().await;
        let space = env
            .fs
            .create_space(&env.ctx, "project", "limited", Some(10))
            .await
            .unwrap();
        let file_ref = |p: &str| Reference::space_path(&space.id, p);

        let upload_id = env
            .fs
            .initiate_upload(&env.ctx, &file_ref("/seven"), 7, UploadOptions::default())
            .await
            .unwrap();
        env.fs
            .upload_chunk(&env.ctx, &upload_id, 0, b"1234567")
            .await
            .unwrap();
        env.fs.finalize_upload(&env.ctx, &upload_id).await.unwrap();

        let err = env
            .fs
            .initiate_upload(&env.ctx, &file_ref("/four"), 4, UploadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DcfsError::InsufficientStorage(_)));

        let (total, in_use, remaining) = env
            .fs
            .get_quota(&env.ctx, &Reference::id(ResourceId::space_root(&space.id)))
            .await
            .unwrap();
        assert_eq!((total, in_use, remaining), (10, 7, 3));
    }

    // ---- trash ----------------------------------------------------------

    #[tokio::test]
    async fn trash_roundtrip_preserves_the_node() {
        let env = create_test_env().await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/d"))
            .await
            .unwrap();
        let rid = env.upload("/d/file", b"payload").await;
        let before = env
            .fs
            .get_md(&env.ctx, &env.space_ref("/d/file"))
            .await
            .unwrap();

        let key = env
            .fs
            .delete(&env.ctx, &env.space_ref("/d/file"))
            .await
            .unwrap();
        assert!(env
            .fs
            .get_md(&env.ctx, &env.space_ref("/d/file"))
            .await
            .unwrap_err()
            .is_not_found());

        let items = env.fs.list_recycle(&env.ctx, &env.space.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, key);
        assert_eq!(items[0].name, "file");
        assert_eq!(items[0].origin, "/d/file");
        assert_eq!(items[0].size, 7);

        let restored = env
            .fs
            .restore_recycle_item(&env.ctx, &env.space.id, &key, None)
            .await
            .unwrap();
        assert_eq!(restored, rid);

        let after = env
            .fs
            .get_md(&env.ctx, &env.space_ref("/d/file"))
            .await
            .unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.name, before.name);
        assert_eq!(after.size, before.size);
        assert_eq!(after.checksums, before.checksums);

        let mut reader = env
            .fs
            .download(&env.ctx, &env.space_ref("/d/file"))
            .await
            .unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"payload");

        assert!(env.fs.list_recycle(&env.ctx, &env.space.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_into_missing_parent_fails() {
        let env = create_test_env().await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/d"))
            .await
            .unwrap();
        env.upload("/d/file", b"x").await;

        let file_key = env
            .fs
            .delete(&env.ctx, &env.space_ref("/d/file"))
            .await
            .unwrap();
        env.fs.delete(&env.ctx, &env.space_ref("/d")).await.unwrap();

        let err = env
            .fs
            .restore_recycle_item(&env.ctx, &env.space.id, &file_key, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DcfsError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn purge_collects_the_blob() {
        let env = create_test_env().await;
        env.upload("/f", b"to be purged").await;
        let node = {
            let listed = env
                .fs
                .list_folder(&env.ctx, &Reference::id(ResourceId::space_root(&env.space.id)))
                .await
                .unwrap();
            Node::read(env.fs.lookup(), &env.space.id, &listed[0].id.opaque_id)
                .await
                .unwrap()
        };
        assert!(!node.blob_id.is_empty());
        assert_eq!(env.blobstore.size(&node.blob_id).await.unwrap(), 12);

        let key = env.fs.delete(&env.ctx, &env.space_ref("/f")).await.unwrap();
        env.fs
            .purge_recycle_item(&env.ctx, &env.space.id, &key)
            .await
            .unwrap();

        assert!(env
            .blobstore
            .size(&node.blob_id)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(env.fs.list_recycle(&env.ctx, &env.space.id).await.unwrap().is_empty());
        let (_, in_use, _) = env
            .fs
            .get_quota(&env.ctx, &Reference::id(ResourceId::space_root(&env.space.id)))
            .await
            .unwrap();
        assert_eq!(in_use, 0);
    }

    // ---- structure and resolution ---------------------------------------

    #[tokio::test]
    async fn parent_links_stay_consistent() {
        let env = create_test_env().await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/p"))
            .await
            .unwrap();
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/p/q"))
            .await
            .unwrap();
        env.upload("/p/q/f", b"1").await;

        let p = env.fs.get_md(&env.ctx, &env.space_ref("/p")).await.unwrap();
        for child in env
            .fs
            .list_folder(&env.ctx, &env.space_ref("/p"))
            .await
            .unwrap()
        {
            assert_eq!(child.parent_id, p.id.opaque_id);
            let on_disk = Node::read(env.fs.lookup(), &env.space.id, &child.id.opaque_id)
                .await
                .unwrap();
            assert_eq!(on_disk.parent_id, p.id.opaque_id);
            assert_eq!(on_disk.name, child.name);
        }
    }

    #[tokio::test]
    async fn relative_references_resolve_from_their_node() {
        let env = create_test_env().await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/a"))
            .await
            .unwrap();
        env.upload("/a/b.txt", b"bb").await;

        let a = env.fs.get_md(&env.ctx, &env.space_ref("/a")).await.unwrap();
        let rel = Reference::relative(a.id.clone(), "./b.txt");
        let md = env.fs.get_md(&env.ctx, &rel).await.unwrap();
        assert_eq!(md.name, "b.txt");

        // a path segment below a file is non-existent, not an error
        let below_file = env
            .fs
            .get_md(&env.ctx, &env.space_ref("/a/b.txt/nope"))
            .await
            .unwrap_err();
        assert!(below_file.is_not_found());
    }

    #[tokio::test]
    async fn move_between_directories_moves_accounting() {
        let env = create_test_env().await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/src"))
            .await
            .unwrap();
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/dst"))
            .await
            .unwrap();
        env.upload("/src/f", b"12345").await;

        env.fs
            .move_node(&env.ctx, &env.space_ref("/src/f"), &env.space_ref("/dst/renamed"))
            .await
            .unwrap();

        assert!(env
            .fs
            .get_md(&env.ctx, &env.space_ref("/src/f"))
            .await
            .unwrap_err()
            .is_not_found());
        let moved = env
            .fs
            .get_md(&env.ctx, &env.space_ref("/dst/renamed"))
            .await
            .unwrap();
        assert_eq!(moved.size, 5);

        let src = env.fs.get_md(&env.ctx, &env.space_ref("/src")).await.unwrap();
        let dst = env.fs.get_md(&env.ctx, &env.space_ref("/dst")).await.unwrap();
        assert_eq!(src.size, 0);
        assert_eq!(dst.size, 5);
    }

    #[tokio::test]
    async fn cross_space_move_is_not_supported() {
        let env = create_test_env().await;
        let project = env
            .fs
            .create_space(&env.ctx, "project", "other", None)
            .await
            .unwrap();
        env.upload("/f", b"x").await;

        let err = env
            .fs
            .move_node(
                &env.ctx,
                &env.space_ref("/f"),
                &Reference::space_path(&project.id, "/f"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DcfsError::NotSupported(_)));
    }

    #[tokio::test]
    async fn etag_changes_on_content_and_child_set_mutations() {
        let env = create_test_env().await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/dir"))
            .await
            .unwrap();
        let dir_etag_1 = env.etag_of("/dir").await;

        env.upload("/dir/f", b"v1").await;
        let dir_etag_2 = env.etag_of("/dir").await;
        let file_etag_1 = env.etag_of("/dir/f").await;
        assert_ne!(dir_etag_1, dir_etag_2);

        // overwrite: file and ancestor etags move again
        env.upload("/dir/f", b"v2-longer").await;
        assert_ne!(env.etag_of("/dir/f").await, file_etag_1);
        assert_ne!(env.etag_of("/dir").await, dir_etag_2);

        let md = env
            .fs
            .get_md(&env.ctx, &env.space_ref("/dir/f"))
            .await
            .unwrap();
        assert_eq!(md.size, 9);
        assert_eq!(md.etag.len(), 34);
    }

    // ---- locks ----------------------------------------------------------

    #[tokio::test]
    async fn lock_lifecycle() {
        let env = create_test_env().await;
        env.upload("/doc", b"x").await;
        let doc = env.space_ref("/doc");

        let lock = LockInfo::new("L1", alice().id);
        env.fs.set_lock(&env.ctx, &doc, &lock).await.unwrap();

        // a second lock is refused
        let second = LockInfo::new("L2", alice().id);
        assert!(matches!(
            env.fs.set_lock(&env.ctx, &doc, &second).await.unwrap_err(),
            DcfsError::PreconditionFailed(_)
        ));

        let read = env.fs.get_lock(&env.ctx, &doc).await.unwrap();
        assert_eq!(read.lock_id, "L1");

        // refresh needs the current id
        let refreshed = LockInfo::new("L1", alice().id);
        env.fs
            .refresh_lock(&env.ctx, &doc, &refreshed, None)
            .await
            .unwrap();
        assert!(matches!(
            env.fs
                .refresh_lock(&env.ctx, &doc, &second, None)
                .await
                .unwrap_err(),
            DcfsError::PreconditionFailed(_)
        ));
        // ...unless the caller names the stored lock explicitly
        env.fs
            .refresh_lock(&env.ctx, &doc, &second, Some("L1"))
            .await
            .unwrap();

        // unlock with the wrong id is fenced
        assert!(matches!(
            env.fs.unlock(&env.ctx, &doc, &lock).await.unwrap_err(),
            DcfsError::Locked(_)
        ));
        env.fs.unlock(&env.ctx, &doc, &second).await.unwrap();
        assert!(env.fs.get_lock(&env.ctx, &doc).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn expired_locks_are_ignored() {
        let env = create_test_env().await;
        env.upload("/doc", b"x").await;
        let doc = env.space_ref("/doc");

        let mut lock = LockInfo::new("L1", alice().id);
        lock.expiration = Some(1); // long gone
        env.fs.set_lock(&env.ctx, &doc, &lock).await.unwrap();

        // mutation passes without a token, the lock is dead
        env.fs.delete(&env.ctx, &doc).await.unwrap();
    }

    // ---- permissions ----------------------------------------------------

    #[tokio::test]
    async fn denials_do_not_disclose_existence() {
        let env = create_test_env().await;
        env.upload("/secret", b"x").await;
        let bob_ctx = RequestContext::new(bob());

        // no stat permission: plain NotFound
        let err = env
            .fs
            .get_md(&bob_ctx, &env.space_ref("/secret"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = env
            .fs
            .delete(&bob_ctx, &env.space_ref("/secret"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // with stat the denial is explicit
        let mut stat_only = PermissionSet::none();
        stat_only.stat = true;
        env.grant(&bob().id, stat_only).await;
        let err = env
            .fs
            .delete(&bob_ctx, &env.space_ref("/secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, DcfsError::PermissionDenied(_)));
    }

    // ---- spaces ---------------------------------------------------------

    #[tokio::test]
    async fn personal_spaces_are_one_per_user() {
        let env = create_test_env().await;
        let err = env
            .fs
            .create_space(&env.ctx, SPACE_TYPE_PERSONAL, "second", None)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        // another user gets their own
        let bob_ctx = RequestContext::new(bob());
        let space = env
            .fs
            .create_space(&bob_ctx, SPACE_TYPE_PERSONAL, "bob's space", None)
            .await
            .unwrap();
        assert_eq!(space.owner, Some(bob().id));
    }

    #[tokio::test]
    async fn list_spaces_filters_and_hides_foreign_spaces() {
        let env = create_test_env().await;
        env.fs
            .create_space(&env.ctx, "project", "proj", None)
            .await
            .unwrap();

        let all = env
            .fs
            .list_spaces(&env.ctx, &SpaceFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let personal_only = env
            .fs
            .list_spaces(
                &env.ctx,
                &SpaceFilter {
                    space_type: Some(SPACE_TYPE_PERSONAL.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(personal_only.len(), 1);
        assert_eq!(personal_only[0].id, env.space.id);

        // bob sees none of alice's spaces
        let bob_ctx = RequestContext::new(bob());
        let bobs = env
            .fs
            .list_spaces(&bob_ctx, &SpaceFilter::default())
            .await
            .unwrap();
        assert!(bobs.is_empty());
    }

    #[tokio::test]
    async fn update_space_is_owner_only() {
        let env = create_test_env().await;
        let patch = SpacePatch {
            name: Some("renamed".to_string()),
            ..Default::default()
        };

        let bob_ctx = RequestContext::new(bob());
        assert!(env
            .fs
            .update_space(&bob_ctx, &env.space.id, &patch)
            .await
            .is_err());

        let updated = env
            .fs
            .update_space(&env.ctx, &env.space.id, &patch)
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");

        let disabled = env
            .fs
            .update_space(
                &env.ctx,
                &env.space.id,
                &SpacePatch {
                    disabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(disabled.disabled);
    }

    // ---- upload edge cases ----------------------------------------------

    #[tokio::test]
    async fn checksum_mismatch_fails_assembly() {
        let env = create_test_env().await;
        let upload_id = env
            .fs
            .initiate_upload(
                &env.ctx,
                &env.space_ref("/f"),
                3,
                UploadOptions {
                    checksum: Some(hex::encode([0u8; 32])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        env.fs
            .upload_chunk(&env.ctx, &upload_id, 0, b"xyz")
            .await
            .unwrap();
        let err = env
            .fs
            .finalize_upload(&env.ctx, &upload_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DcfsError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn incomplete_upload_cannot_finalize() {
        let env = create_test_env().await;
        let upload_id = env
            .fs
            .initiate_upload(&env.ctx, &env.space_ref("/f"), 10, UploadOptions::default())
            .await
            .unwrap();
        env.fs
            .upload_chunk(&env.ctx, &upload_id, 0, b"12345")
            .await
            .unwrap();
        let err = env
            .fs
            .finalize_upload(&env.ctx, &upload_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DcfsError::PreconditionFailed(_)));

        // the session survives for further chunks
        env.fs
            .upload_chunk(&env.ctx, &upload_id, 5, b"67890")
            .await
            .unwrap();
        env.fs.finalize_upload(&env.ctx, &upload_id).await.unwrap();
    }

    #[tokio::test]
    async fn expired_sessions_are_cleared_on_startup() {
        let env = create_test_env().await;
        let upload_id = env
            .fs
            .initiate_upload(
                &env.ctx,
                &env.space_ref("/stale"),
                3,
                UploadOptions {
                    expiration: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(UploadSession::load(env.fs.lookup(), &upload_id).await.is_ok());

        let expired = crate::upload::resume_sessions(env.fs.lookup(), env.fs.tree())
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert!(UploadSession::load(env.fs.lookup(), &upload_id)
            .await
            .unwrap_err()
            .is_not_found());
        // the placeholder went with it
        assert!(env
            .fs
            .get_md(&env.ctx, &env.space_ref("/stale"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn reconciler_repairs_interrupted_accounting() {
        let env = create_test_env().await;
        env.fs
            .create_dir(&env.ctx, &env.space_ref("/d"))
            .await
            .unwrap();
        env.upload("/d/f", b"12345678").await;

        // simulate an interrupted propagation by corrupting the root size
        let root = Node::read(env.fs.lookup(), &env.space.id, &env.space.id)
            .await
            .unwrap();
        root.set_tree_size(env.fs.lookup(), 0).unwrap();

        let fixed = env.fs.tree().reconcile_space(&env.space.id).await.unwrap();
        assert!(fixed >= 1);
        let (_, in_use, _) = env
            .fs
            .get_quota(&env.ctx, &Reference::id(ResourceId::space_root(&env.space.id)))
            .await
            .unwrap();
        assert_eq!(in_use, 8);
    }
}
