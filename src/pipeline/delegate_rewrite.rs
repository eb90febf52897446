use solana_sdk::{
    hash::Hash,
    instruction::{AccountMeta, Instruction},
    message::{Message, VersionedMessage},
    pubkey::Pubkey,
    transaction::VersionedTransaction,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};

use crate::entity::PipelineError;

/// Rewrites a backend-built swap transaction for the delegated fast-session
/// path:
///
/// 1. compute-budget instructions stripped and re-ordered to the front,
/// 2. an idempotent create of the owner's destination token account,
/// 3. an idempotent create of the session's own wrapped-SOL account,
/// 4. a delegate transfer feeding the session's capped wrapped-SOL into
///    that account as swap/fee input,
/// 5. the original swap body, with the ephemeral key left as the sole
///    signer.
///
/// Returns the rewritten instruction list plus the blockhash carried by
/// the original message; the session signs with the ephemeral key as fee
/// payer.
pub fn rewrite_for_delegate(
    unsigned: &VersionedTransaction,
    owner: &Pubkey,
    delegate: &Pubkey,
    token_mint: &Pubkey,
    wsol_budget_lamports: u64,
) -> Result<(Vec<Instruction>, Hash), PipelineError> {
    let message = match &unsigned.message {
        VersionedMessage::Legacy(message) => message,
        VersionedMessage::V0(_) => {
            return Err(PipelineError::ContractViolation(
                "delegated path requires a legacy transaction".to_string(),
            ))
        }
    };

    let decompiled = decompile_instructions(message)?;
    let (compute_budget, mut body): (Vec<_>, Vec<_>) = decompiled
        .into_iter()
        .partition(|ix| ix.program_id == solana_sdk::compute_budget::id());

    // The ephemeral key is the only signer of the rewritten transaction;
    // the owner never sees it.
    for instruction in &mut body {
        for meta in &mut instruction.accounts {
            if meta.pubkey != *delegate {
                meta.is_signer = false;
            }
        }
    }

    let owner_wsol = get_associated_token_address(owner, &spl_token::native_mint::id());
    let session_wsol = get_associated_token_address(delegate, &spl_token::native_mint::id());

    let mut instructions = compute_budget;
    instructions.push(create_associated_token_account_idempotent(
        delegate,
        owner,
        token_mint,
        &spl_token::ID,
    ));
    instructions.push(create_associated_token_account_idempotent(
        delegate,
        delegate,
        &spl_token::native_mint::id(),
        &spl_token::ID,
    ));
    instructions.push(
        spl_token::instruction::transfer(
            &spl_token::ID,
            &owner_wsol,
            &session_wsol,
            delegate,
            &[],
            wsol_budget_lamports,
        )
        .map_err(|e| PipelineError::Signing(format!("delegate transfer instruction: {}", e)))?,
    );
    instructions.extend(body);

    Ok((instructions, message.recent_blockhash))
}

/// Expands a legacy message's compiled instructions back into
/// `Instruction`s, deriving signer/writable flags from the header.
fn decompile_instructions(message: &Message) -> Result<Vec<Instruction>, PipelineError> {
    let keys = &message.account_keys;

    message
        .instructions
        .iter()
        .map(|compiled| {
            let program_id = *keys
                .get(compiled.program_id_index as usize)
                .ok_or_else(out_of_range)?;

            let accounts = compiled
                .accounts
                .iter()
                .map(|&index| {
                    let index = index as usize;
                    let pubkey = *keys.get(index).ok_or_else(out_of_range)?;
                    Ok(AccountMeta {
                        pubkey,
                        is_signer: is_signer_index(message, index),
                        is_writable: is_writable_index(message, index),
                    })
                })
                .collect::<Result<Vec<_>, PipelineError>>()?;

            Ok(Instruction {
                program_id,
                accounts,
                data: compiled.data.clone(),
            })
        })
        .collect()
}

fn out_of_range() -> PipelineError {
    PipelineError::ContractViolation(
        "built transaction references an account outside its table".to_string(),
    )
}

fn is_signer_index(message: &Message, index: usize) -> bool {
    index < message.header.num_required_signatures as usize
}

fn is_writable_index(message: &Message, index: usize) -> bool {
    let signed = message.header.num_required_signatures as usize;
    let readonly_signed = message.header.num_readonly_signed_accounts as usize;
    let readonly_unsigned = message.header.num_readonly_unsigned_accounts as usize;
    let total = message.account_keys.len();

    if index < signed {
        index < signed - readonly_signed
    } else {
        index < total.saturating_sub(readonly_unsigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::compute_budget::ComputeBudgetInstruction;
    use solana_sdk::signature::Signature;

    fn unsigned_legacy(message: Message) -> VersionedTransaction {
        let signatures =
            vec![Signature::default(); message.header.num_required_signatures as usize];
        VersionedTransaction {
            signatures,
            message: VersionedMessage::Legacy(message),
        }
    }

    fn fake_swap_instruction(delegate: &Pubkey) -> Instruction {
        let program = Pubkey::new_unique();
        Instruction {
            program_id: program,
            accounts: vec![
                AccountMeta::new(*delegate, true),
                AccountMeta::new(Pubkey::new_unique(), false),
                AccountMeta::new_readonly(Pubkey::new_unique(), false),
            ],
            data: vec![9, 1, 1],
        }
    }

    #[test]
    fn reorders_compute_budget_and_feeds_the_session_account() {
        let delegate = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let token_mint = Pubkey::new_unique();
        let blockhash = Hash::new_unique();

        // Backend order: swap body first, compute budget last.
        let instructions = vec![
            fake_swap_instruction(&delegate),
            ComputeBudgetInstruction::set_compute_unit_limit(200_000),
            ComputeBudgetInstruction::set_compute_unit_price(1_000),
        ];
        let message = Message::new_with_blockhash(&instructions, Some(&delegate), &blockhash);
        let unsigned = unsigned_legacy(message);

        let (rewritten, carried_blockhash) =
            rewrite_for_delegate(&unsigned, &owner, &delegate, &token_mint, 5_000_000).unwrap();

        assert_eq!(carried_blockhash, blockhash);

        // Both compute-budget instructions moved to the front.
        assert_eq!(rewritten[0].program_id, solana_sdk::compute_budget::id());
        assert_eq!(rewritten[1].program_id, solana_sdk::compute_budget::id());

        // Then the two idempotent account creates and the delegate
        // transfer, then the swap body.
        assert_eq!(
            rewritten[2].program_id,
            spl_associated_token_account::id()
        );
        assert_eq!(
            rewritten[3].program_id,
            spl_associated_token_account::id()
        );
        assert_eq!(rewritten[4].program_id, spl_token::ID);
        assert_eq!(rewritten.len(), 6);

        // The transfer moves the capped amount out of the owner's
        // wrapped-SOL account under delegate authority.
        let owner_wsol = get_associated_token_address(&owner, &spl_token::native_mint::id());
        let session_wsol = get_associated_token_address(&delegate, &spl_token::native_mint::id());
        assert_eq!(rewritten[4].accounts[0].pubkey, owner_wsol);
        assert_eq!(rewritten[4].accounts[1].pubkey, session_wsol);
        assert_eq!(rewritten[4].accounts[2].pubkey, delegate);
        assert!(rewritten[4].accounts[2].is_signer);
    }

    #[test]
    fn delegate_is_the_sole_signer() {
        let delegate = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let stray_signer = Pubkey::new_unique();

        let body = Instruction {
            program_id: Pubkey::new_unique(),
            accounts: vec![
                AccountMeta::new(delegate, true),
                AccountMeta::new(stray_signer, true),
            ],
            data: vec![1],
        };
        let message = Message::new_with_blockhash(
            &[body],
            Some(&delegate),
            &Hash::new_unique(),
        );
        let unsigned = unsigned_legacy(message);

        let (rewritten, _) =
            rewrite_for_delegate(&unsigned, &owner, &delegate, &Pubkey::new_unique(), 1).unwrap();

        for instruction in &rewritten {
            for meta in &instruction.accounts {
                if meta.is_signer {
                    assert_eq!(meta.pubkey, delegate, "only the ephemeral key may sign");
                }
            }
        }
    }

    #[test]
    fn refuses_versioned_v0_messages() {
        use solana_sdk::message::v0;

        let payer = Pubkey::new_unique();
        let v0_message = v0::Message {
            account_keys: vec![payer],
            ..v0::Message::default()
        };
        let unsigned = VersionedTransaction {
            signatures: vec![Signature::default()],
            message: VersionedMessage::V0(v0_message),
        };

        let result = rewrite_for_delegate(
            &unsigned,
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            1,
        );
        assert!(matches!(
            result,
            Err(PipelineError::ContractViolation(_))
        ));
    }
}
