//! The resolution/lifecycle orchestrator (spec §4.3–§4.8): the only piece
//! of this workspace that drives the document stores, the codec, and the
//! external collaborators together.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokenizer_codec::{BatchVersionResolver, TokenFields};
use tokenizer_crypto::{encrypt_chain, ContentEncryptor, RecipientSet};
use tokenizer_kms::TokenizerProvider;
use tokenizer_store::{
    encode_requester, AssuranceFailure, Entity, EntityStore, PairwiseToken, PairwiseTokenStore,
    Registration, RegistrationStore, TokenBatch, TokenBatchStore, UNPINNED,
};
use tokenizer_tasks::TaskExecutor;
use tokenizer_types::{
    Bitstring256, InternalId, NotAllowedReason, Timestamp, TokenizerError, TokenizerResult,
};

use crate::batch_version::BatchVersionRegistry;
use crate::config::TokenizerConfig;
use crate::metrics;

const MAX_TOKEN_COUNT: u16 = 100;
/// Bound on retries for the create/claim CAS loop (§4.3 steps a/b).
const FIND_OR_CREATE_MAX_ATTEMPTS: u32 = 10;
/// Bound on retries for the resolution CAS loop (§4.4 step 7).
const RESOLVE_MAX_ATTEMPTS: u32 = 10;
/// Bound on retries for the registration refresh/insert race (§4.7 step 3).
const REGISTER_REFRESH_MAX_ATTEMPTS: u32 = 5;
/// Bound on retries for the pairwise get/insert race (§4.8).
const PAIRWISE_UPSERT_MAX_ATTEMPTS: u32 = 5;
/// "practically ≤ 2 iterations in healthy systems" (spec §9).
const REGISTER_AND_CREATE_MAX_ATTEMPTS: u32 = 2;
/// Backoff while create_tokens waits for a concurrently-upserted entity to
/// land, in the coupled-creation path (spec §4.3 preconditions).
const ENTITY_RACE_BACKOFF: StdDuration = StdDuration::from_millis(5);

/// The `newRegistration` three-valued hint (spec §9 open question).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationExpectation {
    /// The caller expects a matching registration to already exist.
    ExpectedExisting,
    /// The caller expects no matching registration to exist yet.
    ExpectedNew,
    /// The caller has no expectation either way.
    Unknown,
}

/// Inputs to [`Orchestrator::register_document`].
#[derive(Clone)]
pub struct RegisterDocumentOptions {
    pub external_id: Vec<u8>,
    pub document: Vec<u8>,
    /// Encrypted innermost-first; see [`encrypt_chain`].
    pub recipient_chain: Vec<RecipientSet>,
    pub ttl_ms: i64,
    pub creator: Option<Vec<u8>>,
    pub new_registration: RegistrationExpectation,
    pub internal_id: Option<InternalId>,
}

/// The result of [`Orchestrator::resolve_to_pairwise`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairwiseResolution {
    pub pairwise_token: [u8; 16],
    pub internal_id: InternalId,
    pub is_unpinned: bool,
    pub min_assurance_for_resolution: i32,
}

/// The result of [`Orchestrator::register_document_and_create`].
pub struct RegisterAndCreateResult {
    pub registration: Registration,
    pub tokens: Vec<Vec<u8>>,
}

/// Ties the document stores, the codec, and the external collaborators
/// together into the operations named in spec §2.
pub struct Orchestrator {
    entities: Arc<dyn EntityStore>,
    batches: Arc<dyn TokenBatchStore>,
    registrations: Arc<dyn RegistrationStore>,
    pairwise: Arc<dyn PairwiseTokenStore>,
    batch_versions: Arc<BatchVersionRegistry>,
    tokenizers: Arc<dyn TokenizerProvider>,
    encryptor: Arc<dyn ContentEncryptor>,
    tasks: TaskExecutor,
    config: TokenizerConfig,
}

impl Orchestrator {
    /// Wire up an orchestrator over the given collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entities: Arc<dyn EntityStore>,
        batches: Arc<dyn TokenBatchStore>,
        registrations: Arc<dyn RegistrationStore>,
        pairwise: Arc<dyn PairwiseTokenStore>,
        batch_versions: Arc<BatchVersionRegistry>,
        tokenizers: Arc<dyn TokenizerProvider>,
        encryptor: Arc<dyn ContentEncryptor>,
        config: TokenizerConfig,
    ) -> Self {
        Self {
            entities,
            batches,
            registrations,
            pairwise,
            batch_versions,
            tokenizers,
            encryptor,
            tasks: TaskExecutor::new(config.token_creation_concurrency),
            config,
        }
    }

    // ---- §4.3 token creation -------------------------------------------

    /// Manufacture `token_count` tokens for `internal_id` (spec §4.3).
    pub async fn create_tokens(
        &self,
        internal_id: InternalId,
        attributes: Vec<u8>,
        token_count: u16,
        min_assurance_for_resolution: i32,
    ) -> TokenizerResult<Vec<Vec<u8>>> {
        if token_count == 0 || token_count > MAX_TOKEN_COUNT {
            return Err(TokenizerError::invalid_argument(
                "tokenCount",
                "must be greater than 0 or less than or equal to 100",
            ));
        }

        let started = std::time::Instant::now();
        let mut tokens = Vec::with_capacity(token_count as usize);

        while (tokens.len() as u16) < token_count {
            let remaining_target = token_count - tokens.len() as u16;
            let (batch, claimed, start_index) = self
                .claim_or_create_batch(&internal_id, min_assurance_for_resolution, remaining_target)
                .await?;

            let (params, signer) = self.batch_versions.resolve(batch.batch_version).await?;

            let jobs = (start_index..start_index + claimed as u8).map(|index| {
                let signer = signer.clone();
                let batch_id = batch.id.clone();
                let attributes = attributes.clone();
                async move {
                    let fields = TokenFields {
                        batch_version: batch.batch_version,
                        batch_id,
                        index,
                        attributes,
                    };
                    tokenizer_codec::encode(signer.as_ref(), &fields, params.batch_salt_size).await
                }
            });

            for result in self.tasks.run_bounded(jobs).await {
                let token = result
                    .ok_or_else(|| TokenizerError::internal(TaskPanicked))?
                    ?;
                tokens.push(token);
            }
        }

        metrics::inc_tokens_created(tokens.len() as u64);
        metrics::record_create_tokens_duration(started.elapsed().as_secs_f64());
        Ok(tokens)
    }

    /// Find a usable open batch for `(internal_id, pin_level)`, claim a
    /// slice of it, or create a fresh batch when none is usable. Returns the
    /// batch, how many slots were claimed, and the first claimed index.
    async fn claim_or_create_batch(
        &self,
        internal_id: &InternalId,
        pin_level: i32,
        remaining_target: u16,
    ) -> TokenizerResult<(TokenBatch, u16, u8)> {
        for attempt in 0..FIND_OR_CREATE_MAX_ATTEMPTS {
            let entity = match self.entities.get(internal_id).await {
                Ok(entity) => entity,
                Err(TokenizerError::NotFound(_)) if attempt + 1 < FIND_OR_CREATE_MAX_ATTEMPTS => {
                    // The coupled-creation path (§4.7) upserts the entity
                    // concurrently; give it a moment to land before giving up.
                    tokio::time::sleep(ENTITY_RACE_BACKOFF).await;
                    continue;
                }
                Err(other) => return Err(other),
            };

            let signer = self.tokenizers.current().await?;
            let current_version = self.batch_versions.ensure_for_tokenizer(signer.tokenizer_id()).await?;

            if let Some(batch_id) = entity.open_batch.get(&pin_level).cloned()
                && let Ok(batch) = self.batches.get(&batch_id).await
            {
                let half_ttl = (batch.expires - batch.created) / 2;
                let expiring_soon = tokenizer_types::now() >= batch.expires - half_ttl;
                let stale_unpinned =
                    batch.is_unpinned() && batch.batch_invalidation_count < entity.batch_invalidation_count;
                let usable = batch.batch_version == current_version.id
                    && batch.remaining_token_count != 0
                    && !stale_unpinned
                    && !expiring_soon;

                if usable {
                    let claimed = remaining_target.min(batch.remaining_token_count);
                    let applied = self
                        .batches
                        .claim(&batch.id, internal_id, batch.remaining_token_count, claimed)
                        .await?;
                    if !applied {
                        continue;
                    }

                    let start_index = (batch.max_token_count - batch.remaining_token_count) as u8;
                    if batch.remaining_token_count - claimed == 0 {
                        let expected = batch.is_unpinned().then_some(entity.batch_invalidation_count);
                        let _ = self
                            .entities
                            .clear_open_batch_if_matches(internal_id, pin_level, &batch.id, expected)
                            .await;
                    }
                    return Ok((batch, claimed, start_index));
                }

                let expected = batch.is_unpinned().then_some(entity.batch_invalidation_count);
                let _ = self
                    .entities
                    .clear_open_batch_if_matches(internal_id, pin_level, &batch_id, expected)
                    .await;
            }

            let options = current_version.options;
            let mut id = vec![0u8; options.batch_id_size as usize];
            rand::Rng::fill(&mut rand::rng(), id.as_mut_slice());
            let claimed = remaining_target.min(options.batch_token_count);
            let now = tokenizer_types::now();
            let batch = TokenBatch {
                id: id.clone(),
                internal_id: *internal_id,
                batch_version: current_version.id,
                resolved_list: Bitstring256::default(),
                resolution: Default::default(),
                max_token_count: options.batch_token_count,
                remaining_token_count: options.batch_token_count - claimed,
                expires: now + Duration::milliseconds(options.ttl_ms),
                batch_invalidation_count: entity.batch_invalidation_count,
                min_assurance_for_resolution: pin_level,
                created: now,
                updated: now,
            };

            self.batches.insert_new(batch.clone()).await?;

            let expected = (pin_level == UNPINNED).then_some(entity.batch_invalidation_count);
            let expires = batch.expires;
            let _ = tokio::join!(
                self.entities.set_open_batch(internal_id, pin_level, id, expected),
                self.entities.advance_expires_if_matches(internal_id, expires, expected),
            );

            metrics::inc_batches_created();

            return Ok((batch, claimed, 0));
        }

        Err(TokenizerError::InvalidState(
            "could not find or create an open batch after retrying".to_string(),
        ))
    }

    // ---- §4.4 pairwise resolution ---------------------------------------

    /// Resolve `token` to a per-requester pseudonym (spec §4.4).
    pub async fn resolve_to_pairwise(
        &self,
        requester: &str,
        token: &[u8],
        level_of_assurance: i32,
        allow_resolved_invalidated_tokens: bool,
    ) -> TokenizerResult<PairwiseResolution> {
        let result = self
            .resolve_to_pairwise_inner(requester, token, level_of_assurance, allow_resolved_invalidated_tokens)
            .await;
        metrics::inc_tokens_resolved(if result.is_ok() { "resolved" } else { "rejected" });
        result
    }

    async fn resolve_to_pairwise_inner(
        &self,
        requester: &str,
        token: &[u8],
        level_of_assurance: i32,
        allow_resolved_invalidated_tokens: bool,
    ) -> TokenizerResult<PairwiseResolution> {
        let fields = tokenizer_codec::decode(token, self.batch_versions.as_ref()).await?;
        let encoded_requester = encode_requester(requester);

        for _ in 0..RESOLVE_MAX_ATTEMPTS {
            let batch = self.batches.get(&fields.batch_id).await?;
            let internal_id = batch.internal_id;
            let is_unpinned = batch.is_unpinned();

            let entity_handle = is_unpinned.then(|| {
                let entities = self.entities.clone();
                let internal_id = internal_id;
                tokio::spawn(async move { entities.get(&internal_id).await })
            });

            let already_resolved_globally = batch.resolved_list.get(fields.index);
            let requester_bits = batch.resolution.get(&encoded_requester).copied();
            let already_resolved_by_requester =
                requester_bits.map(|bits| bits.get(fields.index)).unwrap_or(false);

            if already_resolved_globally && !already_resolved_by_requester {
                return Err(TokenizerError::NotAllowed(NotAllowedReason::AlreadyUsed));
            }

            let entity = match entity_handle {
                Some(handle) => Some(handle.await.map_err(TokenizerError::internal)??),
                None => None,
            };

            if is_unpinned {
                let owning_entity = entity
                    .as_ref()
                    .expect("fetched above because the batch is unpinned");
                if batch.batch_invalidation_count != owning_entity.batch_invalidation_count
                    && !allow_resolved_invalidated_tokens
                {
                    return Err(TokenizerError::NotAllowed(NotAllowedReason::Invalidated));
                }
            }

            if already_resolved_globally {
                let pairwise = match self.pairwise.get(&internal_id, requester).await {
                    Ok(existing) => existing,
                    Err(_) => {
                        self.upsert_pairwise_token(internal_id, requester, Some(batch.expires))
                            .await?
                    }
                };
                return self
                    .finish_resolution(
                        pairwise,
                        internal_id,
                        is_unpinned,
                        &batch,
                        entity.as_ref(),
                        level_of_assurance,
                        allow_resolved_invalidated_tokens,
                    )
                    .await;
            }

            let mut new_requester_bits = requester_bits.unwrap_or_default();
            new_requester_bits.set(fields.index);
            let mut new_resolved_list = batch.resolved_list;
            new_resolved_list.set(fields.index);

            let (marked, pairwise) = tokio::join!(
                self.batches.mark_resolved(
                    &fields.batch_id,
                    batch.resolved_list,
                    new_resolved_list,
                    encoded_requester.clone(),
                    new_requester_bits,
                ),
                self.upsert_pairwise_token(internal_id, requester, Some(batch.expires)),
            );

            if !marked? {
                continue;
            }

            return self
                .finish_resolution(
                    pairwise?,
                    internal_id,
                    is_unpinned,
                    &batch,
                    entity.as_ref(),
                    level_of_assurance,
                    allow_resolved_invalidated_tokens,
                )
                .await;
        }

        Err(TokenizerError::InvalidState(
            "could not resolve the token after retrying".to_string(),
        ))
    }

    async fn finish_resolution(
        &self,
        pairwise: PairwiseToken,
        internal_id: InternalId,
        is_unpinned: bool,
        batch: &TokenBatch,
        entity: Option<&Entity>,
        level_of_assurance: i32,
        allow_resolved_invalidated_tokens: bool,
    ) -> TokenizerResult<PairwiseResolution> {
        let effective_min = if is_unpinned {
            entity
                .expect("unpinned resolutions always carry the owning entity")
                .min_assurance_for_resolution
        } else {
            batch.min_assurance_for_resolution
        };

        if level_of_assurance < effective_min && !allow_resolved_invalidated_tokens {
            let failure = AssuranceFailure {
                batch_id: batch.id.clone(),
                batch_invalidation_count: batch.batch_invalidation_count,
                date: tokenizer_types::now(),
            };
            let _ = self.entities.record_assurance_failure(&internal_id, failure).await;
            return Err(TokenizerError::NotAllowed(NotAllowedReason::AssuranceTooLow));
        }

        Ok(PairwiseResolution {
            pairwise_token: pairwise.value,
            internal_id,
            is_unpinned,
            min_assurance_for_resolution: effective_min,
        })
    }

    /// Parse + batch read only; no resolution bookkeeping (spec §4.4).
    pub async fn resolve_to_internal_id(&self, token: &[u8]) -> TokenizerResult<InternalId> {
        let fields = tokenizer_codec::decode(token, self.batch_versions.as_ref()).await?;
        let batch = self.batches.get(&fields.batch_id).await?;
        Ok(batch.internal_id)
    }

    /// Like [`Self::resolve_to_pairwise`] but returns the full entity and
    /// performs no resolved-list marking (spec §4.4).
    pub async fn resolve_to_entity(
        &self,
        token: &[u8],
        allow_invalidated_tokens: bool,
    ) -> TokenizerResult<Entity> {
        let fields = tokenizer_codec::decode(token, self.batch_versions.as_ref()).await?;
        let batch = self.batches.get(&fields.batch_id).await?;
        let entity = self.entities.get(&batch.internal_id).await?;

        if batch.is_unpinned()
            && batch.batch_invalidation_count != entity.batch_invalidation_count
            && !allow_invalidated_tokens
        {
            return Err(TokenizerError::NotAllowed(NotAllowedReason::Invalidated));
        }

        Ok(entity)
    }

    // ---- §4.5 batch invalidation ------------------------------------------

    /// Reject every unpinned token issued so far for `internal_id` (spec §4.5).
    pub async fn invalidate_unpinned_batches(&self, internal_id: &InternalId) -> TokenizerResult<()> {
        let entity = self.entities.get(internal_id).await?;
        let applied = self
            .entities
            .increment_batch_invalidation_count(
                internal_id,
                entity.batch_invalidation_count,
                entity.min_assurance_for_resolution,
                None,
            )
            .await?;
        if !applied {
            return Err(TokenizerError::InvalidState("concurrentChange".to_string()));
        }
        metrics::inc_batches_invalidated();
        Ok(())
    }

    /// As [`Self::invalidate_unpinned_batches`], additionally setting a new
    /// assurance level, conditional on the caller's view of the open
    /// unpinned batch still being current (spec §4.5 "optional
    /// co-modification").
    pub async fn invalidate_unpinned_batches_and_set_assurance(
        &self,
        internal_id: &InternalId,
        expected_open_unpinned_batch: &[u8],
        new_min_assurance: i32,
    ) -> TokenizerResult<()> {
        let entity = self.entities.get(internal_id).await?;
        match entity.open_batch.get(&UNPINNED) {
            Some(current) if current.as_slice() == expected_open_unpinned_batch => {}
            _ => return Err(TokenizerError::InvalidState("concurrentChange".to_string())),
        }
        let applied = self
            .entities
            .increment_batch_invalidation_count(
                internal_id,
                entity.batch_invalidation_count,
                entity.min_assurance_for_resolution,
                Some(new_min_assurance),
            )
            .await?;
        if !applied {
            return Err(TokenizerError::InvalidState("concurrentChange".to_string()));
        }
        metrics::inc_batches_invalidated();
        Ok(())
    }

    // ---- §4.6 assurance policy changes ------------------------------------

    /// Change `internal_id`'s effective minimum assurance level (spec §4.6).
    pub async fn set_min_assurance_for_resolution(
        &self,
        internal_id: &InternalId,
        new_level: i32,
        require_assurance_failed_token_resolution: bool,
        last_batch_invalidation_not_after: Timestamp,
    ) -> TokenizerResult<bool> {
        let entity = self.entities.get(internal_id).await?;

        if require_assurance_failed_token_resolution {
            let failure = entity.last_assurance_failed_token_resolution.as_ref().ok_or_else(|| {
                TokenizerError::InvalidState("no assurance-failed resolution is on record".to_string())
            })?;
            if failure.batch_invalidation_count != entity.batch_invalidation_count {
                return Err(TokenizerError::InvalidState(
                    "the recorded assurance failure is from a prior generation".to_string(),
                ));
            }
            if let Some(last_invalidation) = entity.last_batch_invalidation_date
                && last_invalidation > last_batch_invalidation_not_after
            {
                return Err(TokenizerError::InvalidState(
                    "a batch invalidation happened too recently".to_string(),
                ));
            }
        }

        self.entities
            .set_min_assurance_for_resolution(internal_id, entity.batch_invalidation_count, new_level)
            .await
    }

    /// As [`Self::set_min_assurance_for_resolution`], but only applies when
    /// the entity's open unpinned batch (if any) is no longer valid (spec
    /// §4.6).
    pub async fn update_entity_with_no_valid_token_batches(
        &self,
        internal_id: &InternalId,
        new_min_assurance: i32,
    ) -> TokenizerResult<bool> {
        let entity = self.entities.get(internal_id).await?;

        if let Some(batch_id) = entity.open_batch.get(&UNPINNED)
            && let Ok(batch) = self.batches.get(batch_id).await
        {
            let still_valid = batch.remaining_token_count != 0
                && batch.batch_invalidation_count >= entity.batch_invalidation_count;
            if still_valid {
                return Err(TokenizerError::InvalidState(
                    "the entity still has a valid open unpinned batch".to_string(),
                ));
            }
        }

        self.entities
            .set_min_assurance_for_resolution(internal_id, entity.batch_invalidation_count, new_min_assurance)
            .await
    }

    // ---- §4.7 registration -------------------------------------------------

    /// Register a document under `options.external_id` (spec §4.7).
    pub async fn register_document(&self, options: RegisterDocumentOptions) -> TokenizerResult<Registration> {
        let signer = self.tokenizers.current().await?;
        let (external_id_hash, document_hash) =
            tokio::try_join!(signer.hash(&options.external_id), signer.hash(&options.document))?;

        for _ in 0..REGISTER_REFRESH_MAX_ATTEMPTS {
            let new_expires = tokenizer_types::now() + Duration::milliseconds(options.ttl_ms);
            let creator_hash = match &options.creator {
                Some(creator) => Some(signer.sign(creator).await?.to_vec()),
                None => None,
            };

            let refreshed_entity_fut = async {
                match options.internal_id {
                    Some(internal_id) => self
                        .entities
                        .upsert_advance_expires(&internal_id, new_expires)
                        .await
                        .map(Some),
                    None => Ok(None),
                }
            };
            let (refreshed, _) = tokio::try_join!(
                self.registrations
                    .refresh(&external_id_hash, &document_hash, new_expires, creator_hash.clone()),
                refreshed_entity_fut,
            )?;

            if let Some(registration) = refreshed {
                if let Some(expected) = options.internal_id
                    && registration.internal_id != expected
                {
                    return Err(TokenizerError::invalid_argument(
                        "internalId",
                        "does not match the existing registration",
                    ));
                }
                if options.internal_id.is_none() {
                    self.entities
                        .upsert_advance_expires(&registration.internal_id, new_expires)
                        .await?;
                }
                if matches!(options.new_registration, RegistrationExpectation::ExpectedNew) {
                    return Err(TokenizerError::invalid_argument(
                        "newRegistration",
                        "a registration already exists for this external id and document",
                    ));
                }
                return Ok(registration);
            }

            if matches!(options.new_registration, RegistrationExpectation::ExpectedExisting) {
                return Err(TokenizerError::NotFound("registration"));
            }

            let internal_id = options.internal_id.unwrap_or_else(InternalId::random);
            self.entities.upsert_advance_expires(&internal_id, new_expires).await?;

            let jwe = encrypt_chain(self.encryptor.as_ref(), &options.recipient_chain, &options.document).await?;

            let registration = Registration {
                internal_id,
                external_id_hash: external_id_hash.clone(),
                document_hash: document_hash.clone(),
                tokenizer_id: signer.tokenizer_id().clone(),
                jwe,
                creator_hash: creator_hash.into_iter().collect::<HashSet<_>>(),
                expires: new_expires,
                created: tokenizer_types::now(),
                updated: tokenizer_types::now(),
            };

            match self.registrations.insert_new(registration.clone()).await {
                Ok(()) => return Ok(registration),
                Err(TokenizerError::Duplicate(_)) => continue,
                Err(other) => return Err(other),
            }
        }

        Err(TokenizerError::InvalidState(
            "could not register the document after retrying".to_string(),
        ))
    }

    /// Run `register_document` and `create_tokens` concurrently against the
    /// same internal id (spec §4.7 "latency-optimized variant").
    pub async fn register_document_and_create(
        &self,
        register_options: RegisterDocumentOptions,
        attributes: Vec<u8>,
        token_count: u16,
        min_assurance_for_resolution: i32,
    ) -> TokenizerResult<RegisterAndCreateResult> {
        let signer = self.tokenizers.current().await?;
        let (external_id_hash, document_hash) = tokio::try_join!(
            signer.hash(&register_options.external_id),
            signer.hash(&register_options.document),
        )?;

        let mut internal_id = match register_options.internal_id {
            Some(id) => id,
            None => match self.registrations.get_by_hashes(&external_id_hash, &document_hash).await {
                Ok(existing) => existing.internal_id,
                Err(_) => InternalId::random(),
            },
        };

        for _ in 0..REGISTER_AND_CREATE_MAX_ATTEMPTS {
            let options = RegisterDocumentOptions {
                internal_id: Some(internal_id),
                ..register_options.clone()
            };

            // Snapshot the invalidation count before the batch is inserted so
            // the coupled-creation check below can detect an invalidation
            // that landed while registration and token creation were racing
            // (spec §4.3 step (d)); absent if the entity doesn't exist yet.
            let pre_create_invalidation_count = match self.entities.get(&internal_id).await {
                Ok(entity) => Some(entity.batch_invalidation_count),
                Err(TokenizerError::NotFound(_)) => None,
                Err(other) => return Err(other),
            };

            let (registration, tokens) = tokio::try_join!(
                self.register_document(options),
                self.create_tokens(internal_id, attributes.clone(), token_count, min_assurance_for_resolution),
            )?;

            if registration.internal_id != internal_id {
                // The tokens above are orphaned against the wrong id and will
                // simply expire; retry against the id the registration settled on.
                internal_id = registration.internal_id;
                continue;
            }

            if let Some(observed) = pre_create_invalidation_count {
                let current = self.entities.get(&internal_id).await?;
                if current.batch_invalidation_count != observed {
                    return Err(TokenizerError::NotAllowed(NotAllowedReason::BatchInvalidated));
                }
            }

            return Ok(RegisterAndCreateResult { registration, tokens });
        }

        Err(TokenizerError::InvalidState(
            "could not reconcile registration and token creation after retrying".to_string(),
        ))
    }

    // ---- §4.8 pairwise-token store -----------------------------------------

    /// `getPairwiseToken` (spec §4.8).
    pub async fn get_pairwise_token(
        &self,
        internal_id: &InternalId,
        requester: &str,
    ) -> TokenizerResult<PairwiseToken> {
        let result = self.pairwise.get(internal_id, requester).await;
        metrics::inc_pairwise_lookups(if result.is_ok() { "hit" } else { "miss" });
        result
    }

    /// `resolvePairwiseToken` (spec §4.8).
    pub async fn resolve_pairwise_token(&self, value: &[u8; 16]) -> TokenizerResult<PairwiseToken> {
        let result = self.pairwise.resolve_by_value(value).await;
        metrics::inc_pairwise_lookups(if result.is_ok() { "hit" } else { "miss" });
        result
    }

    /// `upsertPairwiseToken` (spec §4.8): optimistic refresh racing a get,
    /// falling back to insert-on-absent with a duplicate-conflict retry.
    pub async fn upsert_pairwise_token(
        &self,
        internal_id: InternalId,
        requester: &str,
        expires: Option<Timestamp>,
    ) -> TokenizerResult<PairwiseToken> {
        let (_, existing) = tokio::join!(
            self.pairwise.refresh_expires(&internal_id, requester, expires),
            self.pairwise.get(&internal_id, requester),
        );
        if let Ok(token) = existing {
            return Ok(token);
        }

        for _ in 0..PAIRWISE_UPSERT_MAX_ATTEMPTS {
            let now = tokenizer_types::now();
            let mut value = [0u8; 16];
            rand::Rng::fill(&mut rand::rng(), &mut value);
            let token = PairwiseToken {
                internal_id,
                requester: requester.to_string(),
                value,
                expires,
                created: now,
                updated: now,
            };

            match self.pairwise.insert_new(token.clone()).await {
                Ok(()) => return Ok(token),
                Err(TokenizerError::Duplicate(_)) => {
                    if let Ok(existing) = self.pairwise.get(&internal_id, requester).await {
                        return Ok(existing);
                    }
                    continue;
                }
                Err(other) => return Err(other),
            }
        }

        Err(TokenizerError::InvalidState(
            "could not upsert the pairwise token after retrying".to_string(),
        ))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("a token manufacture job panicked")]
struct TaskPanicked;

#[cfg(test)]
mod tests {
    use super::*;
    use tokenizer_crypto::{AesGcmContentEncryptor, RecipientKey};
    use tokenizer_kms::{InMemoryHmacSigner, StaticTokenizerProvider};
    use tokenizer_store::{
        BatchVersionOptions, InMemoryEntityStore, InMemoryPairwiseTokenStore, InMemoryRegistrationStore,
        InMemoryTokenBatchStore,
    };

    async fn test_orchestrator() -> Orchestrator {
        let entities: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
        let batches: Arc<dyn TokenBatchStore> = Arc::new(InMemoryTokenBatchStore::new());
        let registrations: Arc<dyn RegistrationStore> = Arc::new(InMemoryRegistrationStore::new());
        let pairwise: Arc<dyn PairwiseTokenStore> = Arc::new(InMemoryPairwiseTokenStore::new(false));

        let batch_version_store = Arc::new(tokenizer_store::InMemoryBatchVersionStore::new());
        let signer = Arc::new(InMemoryHmacSigner::new("tok-1", b"0123456789abcdef".to_vec()));
        let tokenizers: Arc<dyn TokenizerProvider> = Arc::new(StaticTokenizerProvider::new(signer));
        let batch_versions = Arc::new(BatchVersionRegistry::new(batch_version_store, tokenizers.clone()));

        let encryptor: Arc<dyn ContentEncryptor> = Arc::new(AesGcmContentEncryptor::new());

        let mut config = TokenizerConfig::default();
        config.default_version_options.ttl_ms = 3_600_000;

        let orchestrator = Orchestrator::new(
            entities,
            batches,
            registrations,
            pairwise,
            batch_versions,
            tokenizers,
            encryptor,
            config,
        );

        orchestrator
            .batch_versions
            .set_options(BatchVersionOptions {
                batch_id_size: 16,
                batch_salt_size: 16,
                batch_token_count: 10,
                ttl_ms: 3_600_000,
            })
            .await
            .unwrap();

        orchestrator
    }

    #[tokio::test]
    async fn simple_create_and_resolve() {
        let orchestrator = test_orchestrator().await;
        let internal_id = InternalId::random();
        orchestrator
            .entities
            .upsert_advance_expires(&internal_id, tokenizer_types::now() + Duration::seconds(60))
            .await
            .unwrap();

        let tokens = orchestrator
            .create_tokens(internal_id, vec![1], 1, 2)
            .await
            .unwrap();
        assert_eq!(tokens.len(), 1);

        let resolution = orchestrator
            .resolve_to_pairwise("R", &tokens[0], 2, false)
            .await
            .unwrap();
        assert_eq!(resolution.internal_id, internal_id);
        assert!(!resolution.is_unpinned);
    }

    #[tokio::test]
    async fn double_resolve_same_requester_returns_same_value_other_requester_rejected() {
        let orchestrator = test_orchestrator().await;
        let internal_id = InternalId::random();
        orchestrator
            .entities
            .upsert_advance_expires(&internal_id, tokenizer_types::now() + Duration::seconds(60))
            .await
            .unwrap();
        let tokens = orchestrator.create_tokens(internal_id, vec![], 1, 2).await.unwrap();

        let first = orchestrator
            .resolve_to_pairwise("R", &tokens[0], 2, false)
            .await
            .unwrap();
        let second = orchestrator
            .resolve_to_pairwise("R", &tokens[0], 2, false)
            .await
            .unwrap();
        assert_eq!(first.pairwise_token, second.pairwise_token);

        let err = orchestrator
            .resolve_to_pairwise("S", &tokens[0], 2, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TokenizerError::NotAllowed(NotAllowedReason::AlreadyUsed)
        ));
    }

    #[tokio::test]
    async fn unpinned_low_assurance_is_rejected_after_a_successful_resolve() {
        let orchestrator = test_orchestrator().await;
        let internal_id = InternalId::random();
        orchestrator
            .entities
            .upsert_advance_expires(&internal_id, tokenizer_types::now() + Duration::seconds(60))
            .await
            .unwrap();
        let tokens = orchestrator
            .create_tokens(internal_id, vec![], 1, UNPINNED)
            .await
            .unwrap();

        orchestrator
            .resolve_to_pairwise("R", &tokens[0], 2, false)
            .await
            .unwrap();

        let err = orchestrator
            .resolve_to_pairwise("R", &tokens[0], 1, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TokenizerError::NotAllowed(NotAllowedReason::AssuranceTooLow)
        ));

        let entity = orchestrator.entities.get(&internal_id).await.unwrap();
        assert_eq!(
            entity
                .last_assurance_failed_token_resolution
                .unwrap()
                .batch_invalidation_count,
            0
        );
    }

    #[tokio::test]
    async fn invalidation_rejects_unpinned_tokens_unless_explicitly_allowed() {
        let orchestrator = test_orchestrator().await;
        let internal_id = InternalId::random();
        orchestrator
            .entities
            .upsert_advance_expires(&internal_id, tokenizer_types::now() + Duration::seconds(60))
            .await
            .unwrap();
        let tokens = orchestrator
            .create_tokens(internal_id, vec![], 10, UNPINNED)
            .await
            .unwrap();

        orchestrator
            .resolve_to_pairwise("R", &tokens[0], 2, false)
            .await
            .unwrap();

        orchestrator.invalidate_unpinned_batches(&internal_id).await.unwrap();
        assert_eq!(
            orchestrator.entities.get(&internal_id).await.unwrap().batch_invalidation_count,
            1
        );

        let err = orchestrator
            .resolve_to_pairwise("S", &tokens[1], 2, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TokenizerError::NotAllowed(NotAllowedReason::Invalidated)
        ));

        let allowed = orchestrator
            .resolve_to_pairwise("R", &tokens[0], 2, true)
            .await
            .unwrap();
        assert_eq!(allowed.internal_id, internal_id);
    }

    #[tokio::test]
    async fn token_count_range_is_enforced() {
        let orchestrator = test_orchestrator().await;
        let internal_id = InternalId::random();
        let err = orchestrator.create_tokens(internal_id, vec![], 0, 2).await.unwrap_err();
        assert!(matches!(err, TokenizerError::InvalidArgument { .. }));
        let err = orchestrator.create_tokens(internal_id, vec![], 101, 2).await.unwrap_err();
        assert!(matches!(err, TokenizerError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn register_and_create_links_registration_and_token_batch_expiry() {
        let orchestrator = test_orchestrator().await;
        let options = RegisterDocumentOptions {
            external_id: b"alice@example.com".to_vec(),
            document: b"{}".to_vec(),
            recipient_chain: vec![RecipientSet(vec![RecipientKey([7u8; 32])])],
            ttl_ms: 60_000,
            creator: None,
            new_registration: RegistrationExpectation::Unknown,
            internal_id: None,
        };

        let result = orchestrator
            .register_document_and_create(options, vec![], 1, 2)
            .await
            .unwrap();
        assert_eq!(result.tokens.len(), 1);

        let decoded = tokenizer_codec::decode(&result.tokens[0], orchestrator.batch_versions.as_ref())
            .await
            .unwrap();
        let batch = orchestrator.batches.get(&decoded.batch_id).await.unwrap();
        let delta = (batch.expires - result.registration.expires).num_seconds().abs();
        assert!(delta <= 60);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_and_create_aborts_when_entity_invalidated_mid_flight() {
        let orchestrator = Arc::new(test_orchestrator().await);
        let internal_id = InternalId::random();
        orchestrator
            .entities
            .upsert_advance_expires(&internal_id, tokenizer_types::now() + Duration::seconds(60))
            .await
            .unwrap();

        // Fires once real work (registration's hashing/encryption and token
        // manufacture) is underway, landing the invalidation strictly
        // between the pre-create snapshot and the post-registration re-read.
        let invalidator = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                tokio::time::sleep(StdDuration::from_micros(1)).await;
                orchestrator.invalidate_unpinned_batches(&internal_id).await
            }
        });

        let options = RegisterDocumentOptions {
            external_id: b"bob@example.com".to_vec(),
            document: b"{}".to_vec(),
            recipient_chain: vec![RecipientSet(vec![RecipientKey([9u8; 32])])],
            ttl_ms: 60_000,
            creator: None,
            new_registration: RegistrationExpectation::Unknown,
            internal_id: Some(internal_id),
        };

        let result = orchestrator.register_document_and_create(options, vec![], 1, 2).await;
        invalidator.await.unwrap().unwrap();

        assert!(matches!(
            result,
            Err(TokenizerError::NotAllowed(NotAllowedReason::BatchInvalidated))
        ));
    }

    #[tokio::test]
    async fn token_tamper_is_rejected() {
        let orchestrator = test_orchestrator().await;
        let internal_id = InternalId::random();
        orchestrator
            .entities
            .upsert_advance_expires(&internal_id, tokenizer_types::now() + Duration::seconds(60))
            .await
            .unwrap();
        let mut tokens = orchestrator.create_tokens(internal_id, vec![], 1, 2).await.unwrap();
        let last = tokens[0].len() - 1;
        tokens[0][last] ^= 0xFF;

        let err = orchestrator
            .resolve_to_pairwise("R", &tokens[0], 2, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenizerError::InvalidToken(_)));
    }
}
