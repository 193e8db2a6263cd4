use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_inventory_positions_table::Migration),
            Box::new(m20250101_000002_create_cost_layers_table::Migration),
            Box::new(m20250101_000003_create_cost_components_table::Migration),
            Box::new(m20250101_000004_create_layer_audit_entries_table::Migration),
            Box::new(m20250101_000005_create_integrity_snapshots_table::Migration),
        ]
    }
}

mod m20250101_000001_create_inventory_positions_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_inventory_positions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(InventoryPositions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InventoryPositions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::OrganizationId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::ProductId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::LocationId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InventoryPositions::LotNumber).string().null())
                        .col(
                            ColumnDef::new(InventoryPositions::SerialNumber)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::QuantityOnHand)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::QuantityAllocated)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::QuantityAvailable)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::UnitCost)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::TotalValue)
                                .decimal_len(16, 4)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::AllowNegative)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(ColumnDef::new(InventoryPositions::Category).string().null())
                        .col(
                            ColumnDef::new(InventoryPositions::Status)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::ShippedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::Version)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(InventoryPositions::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // One position per natural key. COALESCE keeps rows with no
            // lot/serial from slipping past the index via NULL.
            manager
                .get_connection()
                .execute_unprepared(
                    "CREATE UNIQUE INDEX uq_positions_natural_key \
                     ON inventory_positions (organization_id, product_id, location_id, \
                     COALESCE(lot_number, ''), COALESCE(serial_number, ''))",
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_positions_serial_number")
                        .table(InventoryPositions::Table)
                        .col(InventoryPositions::SerialNumber)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InventoryPositions::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    pub enum InventoryPositions {
        Table,
        Id,
        OrganizationId,
        ProductId,
        LocationId,
        LotNumber,
        SerialNumber,
        QuantityOnHand,
        QuantityAllocated,
        QuantityAvailable,
        UnitCost,
        TotalValue,
        AllowNegative,
        Category,
        Status,
        ShippedAt,
        Version,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000002_create_cost_layers_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_cost_layers_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CostLayers::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(CostLayers::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(CostLayers::PositionId).uuid().not_null())
                        .col(
                            ColumnDef::new(CostLayers::ReceivedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CostLayers::Sequence).big_integer().not_null())
                        .col(
                            ColumnDef::new(CostLayers::QuantityReceived)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CostLayers::QuantityRemaining)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CostLayers::UnitCost)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(CostLayers::ReferenceType).string().not_null())
                        .col(ColumnDef::new(CostLayers::ReferenceId).uuid().null())
                        .col(ColumnDef::new(CostLayers::ExpiryDate).date().null())
                        .col(ColumnDef::new(CostLayers::Metadata).json_binary().null())
                        .col(
                            ColumnDef::new(CostLayers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CostLayers::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cost_layers_position")
                                .from(CostLayers::Table, CostLayers::PositionId)
                                .to(
                                    super::m20250101_000001_create_inventory_positions_table::InventoryPositions::Table,
                                    super::m20250101_000001_create_inventory_positions_table::InventoryPositions::Id,
                                ),
                        )
                        .to_owned(),
                )
                .await?;

            // The FIFO walk always reads (position_id, received_at, sequence).
            manager
                .create_index(
                    Index::create()
                        .name("idx_cost_layers_fifo_order")
                        .table(CostLayers::Table)
                        .col(CostLayers::PositionId)
                        .col(CostLayers::ReceivedAt)
                        .col(CostLayers::Sequence)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CostLayers::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    pub enum CostLayers {
        Table,
        Id,
        PositionId,
        ReceivedAt,
        Sequence,
        QuantityReceived,
        QuantityRemaining,
        UnitCost,
        ReferenceType,
        ReferenceId,
        ExpiryDate,
        Metadata,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20250101_000003_create_cost_components_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000003_create_cost_components_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CostComponents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CostComponents::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(CostComponents::LayerId).uuid().not_null())
                        .col(
                            ColumnDef::new(CostComponents::ComponentType)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CostComponents::QuantityBasis)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CostComponents::AmountTotal)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CostComponents::AmountPerUnit)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(CostComponents::Currency).string().not_null())
                        .col(
                            ColumnDef::new(CostComponents::ExchangeRate)
                                .decimal_len(16, 8)
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(CostComponents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cost_components_layer")
                                .from(CostComponents::Table, CostComponents::LayerId)
                                .to(
                                    super::m20250101_000002_create_cost_layers_table::CostLayers::Table,
                                    super::m20250101_000002_create_cost_layers_table::CostLayers::Id,
                                ),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_cost_components_layer")
                        .table(CostComponents::Table)
                        .col(CostComponents::LayerId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CostComponents::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    pub enum CostComponents {
        Table,
        Id,
        LayerId,
        ComponentType,
        QuantityBasis,
        AmountTotal,
        AmountPerUnit,
        Currency,
        ExchangeRate,
        CreatedAt,
    }
}

mod m20250101_000004_create_layer_audit_entries_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000004_create_layer_audit_entries_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(LayerAuditEntries::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(LayerAuditEntries::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LayerAuditEntries::PositionId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(LayerAuditEntries::LayerId).uuid().null())
                        .col(ColumnDef::new(LayerAuditEntries::Action).string().not_null())
                        .col(
                            ColumnDef::new(LayerAuditEntries::QuantityDelta)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LayerAuditEntries::CostDelta)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LayerAuditEntries::ReferenceType)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(LayerAuditEntries::ReferenceId).uuid().null())
                        .col(ColumnDef::new(LayerAuditEntries::Note).string().null())
                        .col(
                            ColumnDef::new(LayerAuditEntries::RecordedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_layer_audit_entries_position")
                        .table(LayerAuditEntries::Table)
                        .col(LayerAuditEntries::PositionId)
                        .col(LayerAuditEntries::RecordedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(LayerAuditEntries::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    pub enum LayerAuditEntries {
        Table,
        Id,
        PositionId,
        LayerId,
        Action,
        QuantityDelta,
        CostDelta,
        ReferenceType,
        ReferenceId,
        Note,
        RecordedAt,
    }
}

mod m20250101_000005_create_integrity_snapshots_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000005_create_integrity_snapshots_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(IntegritySnapshots::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(IntegritySnapshots::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IntegritySnapshots::AsOf)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(ColumnDef::new(IntegritySnapshots::Status).string().not_null())
                        .col(
                            ColumnDef::new(IntegritySnapshots::ScannedPositions)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IntegritySnapshots::StockWithoutActiveLayers)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IntegritySnapshots::InventoryValueMismatch)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IntegritySnapshots::NegativeOrOverconsumedLayers)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IntegritySnapshots::DuplicateSerializedAllocations)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IntegritySnapshots::ShipmentLinkStatusMismatch)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IntegritySnapshots::TotalAbsoluteDrift)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IntegritySnapshots::WorstPositions)
                                .json_binary()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IntegritySnapshots::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(IntegritySnapshots::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    pub enum IntegritySnapshots {
        Table,
        Id,
        AsOf,
        Status,
        ScannedPositions,
        StockWithoutActiveLayers,
        InventoryValueMismatch,
        NegativeOrOverconsumedLayers,
        DuplicateSerializedAllocations,
        ShipmentLinkStatusMismatch,
        TotalAbsoluteDrift,
        WorstPositions,
        CreatedAt,
    }
}
