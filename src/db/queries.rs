// Aggregation queries issued by the collectors
//
// Each variant names one query against the Open WebUI schema. The SQL text
// is kept here, away from the collectors, so that schema drift is a matter
// of editing strings rather than collector logic.

use super::Value;

/// Every aggregation the collectors can ask the store for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    // Users
    TotalUsers,
    /// Users whose last activity falls inside the trailing window
    ActiveUsers { window_secs: i64 },
    UsersByRole,
    ActiveAuth,
    OauthUsers,
    UserLastActive,

    // Chats
    TotalChats,
    ActiveChats,
    ArchivedChats,
    PinnedChats,
    SharedChats,
    ChatsByUser,
    /// id, archived, pinned, created_at, payload for every chat
    ChatRecords,
    TotalFolders,
    ChatsInFolders,

    // Documents, files, knowledge bases, memories
    TotalDocuments,
    DocumentsByCollection,
    DocumentsByUser,
    DocumentTimestamps,
    TotalFiles,
    FilesByUser,
    /// The collection name each file's metadata points at (may be NULL)
    FileCollections,
    TotalKnowledgeBases,
    KnowledgeBasesByUser,
    KnowledgeBases,
    TotalMemories,
    MemoriesByUser,

    // Models, tools, functions
    /// id, base_model_id, is_active for every model
    ModelRecords,
    ModelsByUser,
    ModelsByBase,
    /// user_id and payload for every chat, for usage-based model stats
    ChatModelUsage,
    TotalTools,
    ToolsByUser,
    TotalFunctions,
    ActiveFunctions,
    GlobalFunctions,
    FunctionsByType,
    FunctionsByUser,

    // System
    LatestConfig,
    TotalGroups,
    GroupMembers,
    TotalFeedback,
    FeedbackByType,
    /// Row count and size of every table in the public schema
    TableStats,
}

impl Query {
    /// Stable identifier used in log lines
    pub fn name(&self) -> &'static str {
        match self {
            Query::TotalUsers => "total_users",
            Query::ActiveUsers { .. } => "active_users",
            Query::UsersByRole => "users_by_role",
            Query::ActiveAuth => "active_auth",
            Query::OauthUsers => "oauth_users",
            Query::UserLastActive => "user_last_active",
            Query::TotalChats => "total_chats",
            Query::ActiveChats => "active_chats",
            Query::ArchivedChats => "archived_chats",
            Query::PinnedChats => "pinned_chats",
            Query::SharedChats => "shared_chats",
            Query::ChatsByUser => "chats_by_user",
            Query::ChatRecords => "chat_records",
            Query::TotalFolders => "total_folders",
            Query::ChatsInFolders => "chats_in_folders",
            Query::TotalDocuments => "total_documents",
            Query::DocumentsByCollection => "documents_by_collection",
            Query::DocumentsByUser => "documents_by_user",
            Query::DocumentTimestamps => "document_timestamps",
            Query::TotalFiles => "total_files",
            Query::FilesByUser => "files_by_user",
            Query::FileCollections => "file_collections",
            Query::TotalKnowledgeBases => "total_knowledge_bases",
            Query::KnowledgeBasesByUser => "knowledge_bases_by_user",
            Query::KnowledgeBases => "knowledge_bases",
            Query::TotalMemories => "total_memories",
            Query::MemoriesByUser => "memories_by_user",
            Query::ModelRecords => "model_records",
            Query::ModelsByUser => "models_by_user",
            Query::ModelsByBase => "models_by_base",
            Query::ChatModelUsage => "chat_model_usage",
            Query::TotalTools => "total_tools",
            Query::ToolsByUser => "tools_by_user",
            Query::TotalFunctions => "total_functions",
            Query::ActiveFunctions => "active_functions",
            Query::GlobalFunctions => "global_functions",
            Query::FunctionsByType => "functions_by_type",
            Query::FunctionsByUser => "functions_by_user",
            Query::LatestConfig => "latest_config",
            Query::TotalGroups => "total_groups",
            Query::GroupMembers => "group_members",
            Query::TotalFeedback => "total_feedback",
            Query::FeedbackByType => "feedback_by_type",
            Query::TableStats => "table_stats",
        }
    }

    /// PostgreSQL text for this query
    pub fn sql(&self) -> &'static str {
        match self {
            Query::TotalUsers => r#"SELECT COUNT(*) FROM public."user""#,
            Query::ActiveUsers { .. } => {
                r#"SELECT COUNT(*) FROM public."user"
                   WHERE last_active_at >= EXTRACT(EPOCH FROM now())::bigint - $1"#
            }
            Query::UsersByRole => r#"SELECT role, COUNT(*) FROM public."user" GROUP BY role"#,
            Query::ActiveAuth => "SELECT COUNT(*) FROM public.auth WHERE active = true",
            Query::OauthUsers => {
                r#"SELECT COUNT(*) FROM public."user" WHERE oauth_sub IS NOT NULL"#
            }
            Query::UserLastActive => r#"SELECT id, name, last_active_at FROM public."user""#,

            Query::TotalChats => "SELECT COUNT(*) FROM public.chat",
            Query::ActiveChats => "SELECT COUNT(*) FROM public.chat WHERE archived = false",
            Query::ArchivedChats => "SELECT COUNT(*) FROM public.chat WHERE archived = true",
            Query::PinnedChats => "SELECT COUNT(*) FROM public.chat WHERE pinned = true",
            Query::SharedChats => "SELECT COUNT(*) FROM public.chat WHERE share_id IS NOT NULL",
            Query::ChatsByUser => {
                r#"SELECT c.user_id, u.name, COUNT(*)
                   FROM public.chat c
                   JOIN public."user" u ON c.user_id = u.id
                   GROUP BY c.user_id, u.name"#
            }
            Query::ChatRecords => {
                "SELECT id, COALESCE(archived, false), COALESCE(pinned, false), created_at, chat
                 FROM public.chat"
            }
            Query::TotalFolders => "SELECT COUNT(*) FROM public.folder",
            Query::ChatsInFolders => {
                r#"SELECT f.id, f.name, f.user_id, u.name, COUNT(c.id)
                   FROM public.folder f
                   JOIN public."user" u ON f.user_id = u.id
                   LEFT JOIN public.chat c ON c.folder_id = f.id
                   GROUP BY f.id, f.name, f.user_id, u.name"#
            }

            Query::TotalDocuments => "SELECT COUNT(*) FROM public.document",
            Query::DocumentsByCollection => {
                "SELECT collection_name, COUNT(*) FROM public.document GROUP BY collection_name"
            }
            Query::DocumentsByUser => {
                "SELECT user_id, COUNT(*) FROM public.document GROUP BY user_id"
            }
            Query::DocumentTimestamps => "SELECT timestamp FROM public.document",
            Query::TotalFiles => "SELECT COUNT(*) FROM public.file",
            Query::FilesByUser => "SELECT user_id, COUNT(*) FROM public.file GROUP BY user_id",
            Query::FileCollections => "SELECT meta->>'collection_name' FROM public.file",
            Query::TotalKnowledgeBases => "SELECT COUNT(*) FROM public.knowledge",
            Query::KnowledgeBasesByUser => {
                "SELECT user_id, COUNT(*) FROM public.knowledge GROUP BY user_id"
            }
            Query::KnowledgeBases => "SELECT id, name FROM public.knowledge",
            Query::TotalMemories => "SELECT COUNT(*) FROM public.memory",
            Query::MemoriesByUser => "SELECT user_id, COUNT(*) FROM public.memory GROUP BY user_id",

            Query::ModelRecords => {
                "SELECT id, base_model_id, COALESCE(is_active, false) FROM public.model"
            }
            Query::ModelsByUser => {
                r#"SELECT m.user_id, u.name, COUNT(*)
                   FROM public.model m
                   JOIN public."user" u ON m.user_id = u.id
                   GROUP BY m.user_id, u.name"#
            }
            Query::ModelsByBase => {
                "SELECT base_model_id, name, COUNT(*)
                 FROM public.model
                 WHERE base_model_id IS NOT NULL
                 GROUP BY base_model_id, name"
            }
            Query::ChatModelUsage => "SELECT user_id, chat FROM public.chat",
            Query::TotalTools => "SELECT COUNT(*) FROM public.tool",
            Query::ToolsByUser => {
                r#"SELECT t.user_id, u.name, t.name, COUNT(*)
                   FROM public.tool t
                   JOIN public."user" u ON t.user_id = u.id
                   GROUP BY t.user_id, u.name, t.name"#
            }
            Query::TotalFunctions => "SELECT COUNT(*) FROM public.function",
            Query::ActiveFunctions => "SELECT COUNT(*) FROM public.function WHERE is_active = true",
            Query::GlobalFunctions => "SELECT COUNT(*) FROM public.function WHERE is_global = true",
            Query::FunctionsByType => {
                "SELECT type, name, COUNT(*) FROM public.function GROUP BY type, name"
            }
            Query::FunctionsByUser => {
                r#"SELECT f.user_id, u.name, f.name, COUNT(*)
                   FROM public.function f
                   JOIN public."user" u ON f.user_id = u.id
                   GROUP BY f.user_id, u.name, f.name"#
            }

            Query::LatestConfig => {
                "SELECT version::bigint, EXTRACT(EPOCH FROM updated_at)::float8
                 FROM public.config
                 ORDER BY id DESC
                 LIMIT 1"
            }
            Query::TotalGroups => r#"SELECT COUNT(*) FROM public."group""#,
            Query::GroupMembers => {
                r#"SELECT g.id, g.name, g.user_id, u.name, g.user_ids
                   FROM public."group" g
                   JOIN public."user" u ON g.user_id = u.id
                   WHERE g.user_ids IS NOT NULL"#
            }
            Query::TotalFeedback => "SELECT COUNT(*) FROM public.feedback",
            Query::FeedbackByType => {
                r#"SELECT f.type, f.user_id, u.name, COUNT(*)
                   FROM public.feedback f
                   LEFT JOIN public."user" u ON f.user_id = u.id
                   WHERE f.type IS NOT NULL
                   GROUP BY f.type, f.user_id, u.name"#
            }
            Query::TableStats => {
                "SELECT relname::text, n_live_tup::bigint, pg_total_relation_size(relid)::bigint
                 FROM pg_catalog.pg_stat_user_tables
                 WHERE schemaname = 'public'
                 ORDER BY relname"
            }
        }
    }

    /// Bind parameters, in `$n` order
    pub fn params(&self) -> Vec<Value> {
        match self {
            Query::ActiveUsers { window_secs } => vec![Value::Int(*window_secs)],
            _ => Vec::new(),
        }
    }
}
